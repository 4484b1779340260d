// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in sandbox configuration templates.
//!
//! Every string value is rendered through the `quote` filter, which produces a
//! double-quoted literal with JSON escaping. Identifiers go through `ident`.

use minijinja::Environment;

/// Compatibility date pinned for every generated worker.
pub const COMPATIBILITY_DATE: &str = "2025-05-08";

pub(crate) const MAIN: &str = "main";
pub(crate) const WORKER_EXTENSION: &str = "worker_extension";
pub(crate) const RUNTIME_EXTENSION: &str = "runtime_extension";
pub(crate) const SERVICE_NETWORK: &str = "service_network";
pub(crate) const CONTROL: &str = "control";

const MAIN_SOURCE: &str = r#"using Workerd = import "/workerd/workerd.capnp";

const config :Workerd.Config = (
  services = [
    (name = {{ uid|quote }}, worker = .v{{ uid|ident }}Worker),
    (
      name = "internet",
      network = (allow = ["public", "private"], tlsOptions = (trustBrowserCas = true))
    ),
{{ services }}  ],

  sockets = [
    (
      name = {{ uid|quote }},
      address = {{ address|quote }},
      http = (),
      service = {{ uid|quote }}
    ),
{{ sockets }}  ],

  extensions = [{{ extensions }}],
);

const v{{ uid|ident }}Worker :Workerd.Worker = (
  modules = [
    (name = {{ entry|quote }}, esModule = embed {{ ("src/" ~ entry)|quote }}),
  ],
  compatibilityDate = {{ compatibility_date|quote }},
  bindings = [{{ bindings }}],
  compatibilityFlags = [{% for flag in flags %}{{ flag|quote }},{% endfor %}],
);
{{ declarations }}
"#;

const WORKER_EXTENSION_SOURCE: &str = r#"
const v{{ binding|ident }}Ext :Workerd.Worker = (
  modules = [
    (name = {{ (kind ~ ".js")|quote }}, esModule = embed {{ ("../../lib/" ~ module ~ ".js")|quote }}),
  ],
  compatibilityDate = {{ compatibility_date|quote }},
  bindings = [
{% for name, value in vars %}    (name = {{ name|quote }}, text = {{ value|quote }}),
{% endfor %}  ],
);
"#;

const RUNTIME_EXTENSION_SOURCE: &str = r#"
const e{{ kind|ident }} :Workerd.Extension = (
  modules = [
    (name = {{ (kind ~ ":binding")|quote }}, esModule = embed {{ ("../../lib/" ~ module ~ ".js")|quote }}, internal = true),
  ],
);
"#;

const SERVICE_NETWORK_SOURCE: &str = r#"
const n{{ name|ident }}Network :Workerd.ExternalServer = (
  address = {{ address|quote }},
  http = (
    injectRequestHeaders = [
{% for name, value in headers %}      (name = {{ name|quote }}, value = {{ value|quote }}),
{% endfor %}    ]
  )
);
"#;

const CONTROL_SOURCE: &str = r#"
const vControl :Workerd.Worker = (
  modules = [
    (name = "control", esModule = embed "../../lib/control.js"),
  ],
  compatibilityDate = {{ compatibility_date|quote }},
  bindings = [(name = "worker", service = {{ uid|quote }}),],
);
"#;

/// Quote a string as a configuration text literal.
pub fn quote(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// Turn an arbitrary name into a configuration identifier fragment.
pub fn ident(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Build the template environment.
///
/// # Panics
///
/// Panics if a built-in template does not parse. The templates are compiled into
/// the binary, so this can only happen on a broken build.
pub(crate) fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_filter("quote", |value: String| quote(&value));
    env.add_filter("ident", |value: String| ident(&value));

    for (name, source) in [
        (MAIN, MAIN_SOURCE),
        (WORKER_EXTENSION, WORKER_EXTENSION_SOURCE),
        (RUNTIME_EXTENSION, RUNTIME_EXTENSION_SOURCE),
        (SERVICE_NETWORK, SERVICE_NETWORK_SOURCE),
        (CONTROL, CONTROL_SOURCE),
    ] {
        if let Err(e) = env.add_template(name, source) {
            panic!("built-in config template {} is malformed: {}", name, e);
        }
    }

    env
}

// ============================================================================
// Shims
// ============================================================================

/// Control-plane module bound to the main worker.
pub const CONTROL_SHIM: &str = r#"export default {
  async fetch(request, env) {
    const url = new URL(request.url);
    if (url.pathname === "/__control/health") {
      return new Response("ok");
    }
    if (url.pathname === "/__control/scheduled") {
      const event = await request.json();
      await env.worker.scheduled({ scheduledTime: new Date(event.scheduledTime), cron: event.cron });
      return new Response(JSON.stringify({ code: 0 }));
    }
    return env.worker.fetch(request);
  },
};
"#;

pub(crate) const SQL_SHIM: &str = r#"import { WorkerEntrypoint } from "cloudflare:workers";

export default class extends WorkerEntrypoint {
  connection() {
    return {
      host: this.env.HOST,
      port: Number(this.env.PORT),
      user: this.env.USER,
      password: this.env.PASSWORD,
      database: this.env.DATABASE,
    };
  }
}
"#;

pub(crate) const KV_SHIM: &str = r#"import { WorkerEntrypoint } from "cloudflare:workers";

export default class extends WorkerEntrypoint {
  endpoint() {
    return { host: this.env.ENDPOINT, port: Number(this.env.PORT), resourceId: this.env.RESOURCE_ID };
  }
}
"#;

pub(crate) const OSS_SHIM: &str = r#"import { WorkerEntrypoint } from "cloudflare:workers";

export default class extends WorkerEntrypoint {
  async request(path, init = {}) {
    const headers = new Headers(init.headers);
    headers.set("x-node-name", this.env.X_NODENAME);
    headers.set("x-secret", this.env.X_SECRET);
    headers.set("x-resource-id", this.env.RESOURCE_ID);
    return fetch(this.env.OSS_AGENT_URL + path, { ...init, headers });
  }
}
"#;

pub(crate) const AI_SHIM: &str = r#"import { WorkerEntrypoint } from "cloudflare:workers";

export default class extends WorkerEntrypoint {
  async chat(messages) {
    const response = await fetch(this.env.BASE_URL + "/chat/completions", {
      method: "POST",
      headers: {
        "content-type": "application/json",
        authorization: "Bearer " + this.env.API_KEY,
      },
      body: JSON.stringify({ model: this.env.MODEL, messages }),
    });
    return response.json();
  }
}
"#;

pub(crate) const MASTER_CALL_SHIM: &str = r#"import { WorkerEntrypoint } from "cloudflare:workers";

export default class extends WorkerEntrypoint {
  async call(path, body) {
    return fetch(this.env.MASTER_ENDPOINT + path, {
      method: "POST",
      headers: {
        "content-type": "application/json",
        "x-node-name": this.env.X_NODENAME,
        "x-secret": this.env.X_SECRET,
        "x-worker-uid": this.env.WORKER_UID,
      },
      body: JSON.stringify(body),
    });
  }
}
"#;

pub(crate) const AI_EXTENSION_SHIM: &str = r#"export default function (env) {
  return {
    async chat(messages) {
      return env.fetch("/chat/completions", { method: "POST", body: JSON.stringify({ messages }) });
    },
  };
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates_parse() {
        let env = environment();
        for name in [MAIN, WORKER_EXTENSION, RUNTIME_EXTENSION, SERVICE_NETWORK, CONTROL] {
            assert!(env.get_template(name).is_ok(), "{} missing", name);
        }
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn test_ident_replaces_separators() {
        assert_eq!(ident("billing-api.v2"), "billing_api_v2");
    }
}
