// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-type binding builders.
//!
//! Each declared binding turns into up to three fragments of the sandbox
//! configuration:
//!
//! | Style       | Declaration                    | Service injection            | Binding                                |
//! |-------------|--------------------------------|------------------------------|----------------------------------------|
//! | `Worker`    | `const v<binding>Ext` worker   | `(name, worker = .v..Ext)`   | `(name, service = "<binding>Ext")`     |
//! | `Extension` | `const e<kind>` extension      | listed under `extensions`    | `(name, wrapped = (moduleName = ..))`  |
//!
//! The builder table is static; a type missing from it is warned about and skipped.

use std::collections::{BTreeMap, BTreeSet};

use edgehost_agent_sdk::WorkerRecord;
use edgehost_agent_sdk::auth::{HEADER_CALLER_TOKEN, HEADER_CALLER_UID, service_token};
use minijinja::{Environment, context};
use tracing::warn;

use super::GeneratorContext;
use super::declaration::{
    AiBinding, KvBinding, OssBinding, SqlBinding, WorkerDeclaration, binding_name,
};
use super::template::{self, COMPATIBILITY_DATE, ident, quote};
use crate::error::Result;
use crate::scheduler::DEFAULT_CONTROL_HOST;

/// How a binding type is wired into the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderStyle {
    /// A helper worker the main worker calls through a service binding.
    Worker,
    /// A runtime extension module exposed through a wrapped binding.
    Extension,
}

/// One row of the builder table.
#[derive(Debug)]
pub struct BindingBuilder {
    /// Binding type.
    pub kind: &'static str,
    /// Shim file name under the shared lib directory, without extension.
    pub module: &'static str,
    /// Wiring style.
    pub style: BuilderStyle,
    /// Shim script written to the shared lib directory.
    pub shim: &'static str,
}

/// Builders for helper-worker bindings.
pub static WORKER_BUILDERS: &[BindingBuilder] = &[
    BindingBuilder { kind: "ai", module: "ai", style: BuilderStyle::Worker, shim: template::AI_SHIM },
    BindingBuilder { kind: "pgsql", module: "pgsql", style: BuilderStyle::Worker, shim: template::SQL_SHIM },
    BindingBuilder { kind: "mysql", module: "mysql", style: BuilderStyle::Worker, shim: template::SQL_SHIM },
    BindingBuilder { kind: "kv", module: "kv", style: BuilderStyle::Worker, shim: template::KV_SHIM },
    BindingBuilder { kind: "oss", module: "oss", style: BuilderStyle::Worker, shim: template::OSS_SHIM },
    BindingBuilder { kind: "assets", module: "assets", style: BuilderStyle::Worker, shim: template::MASTER_CALL_SHIM },
    BindingBuilder { kind: "task", module: "task", style: BuilderStyle::Worker, shim: template::MASTER_CALL_SHIM },
];

/// Builders for runtime extensions, looked up by the declared extension name.
pub static EXTENSION_BUILDERS: &[BindingBuilder] = &[BindingBuilder {
    kind: "ai",
    module: "ai-ext",
    style: BuilderStyle::Extension,
    shim: template::AI_EXTENSION_SHIM,
}];

/// Find the builder for `kind` in `table`.
pub fn lookup(table: &'static [BindingBuilder], kind: &str) -> Option<&'static BindingBuilder> {
    table.iter().find(|b| b.kind == kind)
}

/// A peer worker reachable through a service binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerWorker {
    /// Peer UID.
    pub uid: String,
    /// Peer socket port.
    pub port: u16,
}

/// Accumulated configuration fragments.
#[derive(Debug, Default)]
pub(crate) struct Fragments {
    pub declarations: String,
    pub services: String,
    pub sockets: String,
    pub bindings: String,
    pub extensions: String,
    pub shims: BTreeMap<&'static str, &'static str>,
    bound: BTreeSet<String>,
}

impl Fragments {
    /// Reserve a binding name. A name already taken is warned about and refused.
    fn bind(&mut self, worker: &WorkerRecord, binding: &str) -> bool {
        if self.bound.insert(binding.to_string()) {
            return true;
        }
        warn!(worker_uid = %worker.uid, binding = %binding, "Duplicate binding name, skipping");
        false
    }

    fn push_worker(
        &mut self,
        env: &Environment<'static>,
        worker: &WorkerRecord,
        builder: &'static BindingBuilder,
        binding: &str,
        vars: Vec<(&'static str, String)>,
    ) -> Result<()> {
        if !self.bind(worker, binding) {
            return Ok(());
        }
        self.declarations.push_str(&env.get_template(template::WORKER_EXTENSION)?.render(
            context! {
                binding => binding,
                kind => builder.kind,
                module => builder.module,
                compatibility_date => COMPATIBILITY_DATE,
                vars => vars,
            },
        )?);

        let service = format!("{}Ext", binding);
        self.services.push_str(&format!(
            "    (name = {}, worker = .v{}Ext),\n",
            quote(&service),
            ident(binding)
        ));
        self.bindings.push_str(&format!(
            "\n    (name = {}, service = {}),",
            quote(binding),
            quote(&service)
        ));
        self.shims.insert(builder.module, builder.shim);
        Ok(())
    }

    fn push_extension(
        &mut self,
        env: &Environment<'static>,
        worker: &WorkerRecord,
        builder: &'static BindingBuilder,
        binding: &str,
    ) -> Result<()> {
        if !self.bind(worker, binding) {
            return Ok(());
        }
        let extension = format!(".e{},", ident(builder.kind));
        // One extension declaration serves every binding of its type.
        if !self.extensions.contains(&extension) {
            self.declarations.push_str(
                &env.get_template(template::RUNTIME_EXTENSION)?
                    .render(context! { kind => builder.kind, module => builder.module })?,
            );
            self.extensions.push_str(&extension);
        }
        self.bindings.push_str(&format!(
            "\n    (name = {}, wrapped = (moduleName = {})),",
            quote(binding),
            quote(&format!("{}:binding", builder.kind))
        ));
        self.shims.insert(builder.module, builder.shim);
        Ok(())
    }

    fn push_service(
        &mut self,
        env: &Environment<'static>,
        service: &str,
        caller: &WorkerRecord,
        peer: &PeerWorker,
        cluster_secret: &str,
    ) -> Result<()> {
        let name = service.replace('-', "_");
        if !self.bind(caller, &name) {
            return Ok(());
        }
        let headers = vec![
            (HEADER_CALLER_UID, caller.uid.clone()),
            (HEADER_CALLER_TOKEN, service_token(&caller.uid, cluster_secret)),
        ];
        self.declarations.push_str(&env.get_template(template::SERVICE_NETWORK)?.render(
            context! {
                name => name,
                address => format!("127.0.0.1:{}", peer.port),
                headers => headers,
            },
        )?);

        let network = format!("{}Network", name);
        self.services.push_str(&format!(
            "    (name = {}, external = .n{}Network),\n",
            quote(&network),
            ident(&name)
        ));
        self.bindings.push_str(&format!(
            "\n    (name = {}, service = {}),",
            quote(&name),
            quote(&network)
        ));
        Ok(())
    }

    fn push_control(
        &mut self,
        env: &Environment<'static>,
        worker: &WorkerRecord,
    ) -> Result<()> {
        self.declarations.push_str(&env.get_template(template::CONTROL)?.render(context! {
            uid => worker.uid,
            compatibility_date => COMPATIBILITY_DATE,
        })?);
        self.services
            .push_str("    (name = \"control\", worker = .vControl),\n");
        self.sockets.push_str(&format!(
            "    (\n      name = \"control\",\n      address = {},\n      http = (),\n      service = \"control\"\n    ),\n",
            quote(&format!("{}:{}", DEFAULT_CONTROL_HOST, worker.control_port))
        ));
        self.shims.insert("control", template::CONTROL_SHIM);
        Ok(())
    }

    fn push_vars(&mut self, vars: &serde_json::Value) {
        self.bindings.push_str(&format!(
            "\n    (name = \"vars\", json = {}),",
            quote(&vars.to_string())
        ));
    }
}

/// Walk a declaration and collect every fragment it produces.
pub(crate) fn build_fragments(
    env: &Environment<'static>,
    ctx: &GeneratorContext,
    worker: &WorkerRecord,
    declaration: &WorkerDeclaration,
    peers: &BTreeMap<String, PeerWorker>,
) -> Result<Fragments> {
    let mut fragments = Fragments::default();

    for extension in &declaration.extensions {
        match lookup(EXTENSION_BUILDERS, &extension.name) {
            Some(builder) => fragments.push_extension(
                env,
                worker,
                builder,
                binding_name(&extension.binding, builder.kind),
            )?,
            None => warn!(
                worker_uid = %worker.uid,
                extension = %extension.name,
                "Unknown extension type, skipping"
            ),
        }
    }

    for ai in &declaration.ai {
        push_typed(&mut fragments, env, worker, "ai", &ai.binding, ai_vars(ai))?;
    }
    for sql in &declaration.pgsql {
        let vars = sql_vars(sql, ctx.client_ports.postgres);
        push_typed(&mut fragments, env, worker, "pgsql", &sql.binding, vars)?;
    }
    for sql in &declaration.mysql {
        let vars = sql_vars(sql, ctx.client_ports.mysql);
        push_typed(&mut fragments, env, worker, "mysql", &sql.binding, vars)?;
    }
    for kv in &declaration.kv {
        push_typed(&mut fragments, env, worker, "kv", &kv.binding, kv_vars(kv, ctx))?;
    }
    for oss in &declaration.oss {
        push_typed(&mut fragments, env, worker, "oss", &oss.binding, oss_vars(oss, ctx))?;
    }
    for assets in &declaration.assets {
        let vars = master_vars(worker, ctx);
        push_typed(&mut fragments, env, worker, "assets", &assets.binding, vars)?;
    }
    for task in &declaration.task {
        let vars = master_vars(worker, ctx);
        push_typed(&mut fragments, env, worker, "task", &task.binding, vars)?;
    }

    let mut seen = BTreeSet::new();
    for service in &declaration.services {
        if !seen.insert(service.as_str()) {
            continue;
        }
        match peers.get(service) {
            Some(peer) => {
                fragments.push_service(env, service, worker, peer, &ctx.cluster_secret)?
            }
            None => warn!(
                worker_uid = %worker.uid,
                service = %service,
                "Service binding target not found, skipping"
            ),
        }
    }

    if let Some(vars) = &declaration.vars {
        fragments.push_vars(vars);
    }

    fragments.push_control(env, worker)?;

    Ok(fragments)
}

fn push_typed(
    fragments: &mut Fragments,
    env: &Environment<'static>,
    worker: &WorkerRecord,
    kind: &str,
    binding: &str,
    vars: Vec<(&'static str, String)>,
) -> Result<()> {
    match lookup(WORKER_BUILDERS, kind) {
        Some(builder) => {
            fragments.push_worker(env, worker, builder, binding_name(binding, builder.kind), vars)
        }
        None => {
            warn!(worker_uid = %worker.uid, kind = %kind, "Unknown binding type, skipping");
            Ok(())
        }
    }
}

fn ai_vars(ai: &AiBinding) -> Vec<(&'static str, String)> {
    vec![
        ("API_KEY", ai.api_key.clone()),
        ("BASE_URL", ai.base_url.clone()),
        ("MODEL", ai.model.clone()),
    ]
}

/// Bindings backed by a managed resource go through the local client port.
fn sql_vars(sql: &SqlBinding, client_port: u16) -> Vec<(&'static str, String)> {
    let (host, port) = if sql.resource_id.is_empty() {
        (sql.host.clone(), sql.port)
    } else {
        ("localhost".to_string(), client_port)
    };
    vec![
        ("HOST", host),
        ("PORT", port.to_string()),
        ("USER", sql.user.clone()),
        ("PASSWORD", sql.password.clone()),
        ("DATABASE", sql.database.clone()),
    ]
}

fn kv_vars(kv: &KvBinding, ctx: &GeneratorContext) -> Vec<(&'static str, String)> {
    let (host, port) = if kv.resource_id.is_empty() {
        (kv.host.clone(), kv.port)
    } else {
        ("localhost".to_string(), ctx.client_ports.kv)
    };
    vec![
        ("ENDPOINT", host),
        ("PORT", port.to_string()),
        ("RESOURCE_ID", kv.resource_id.clone()),
    ]
}

fn oss_vars(oss: &OssBinding, ctx: &GeneratorContext) -> Vec<(&'static str, String)> {
    let agent_url = if oss.resource_id.is_empty() {
        ctx.master_endpoint.clone()
    } else {
        format!("http://127.0.0.1:{}", ctx.api_port)
    };
    vec![
        ("ENDPOINT", oss.host.clone()),
        ("PORT", oss.port.to_string()),
        ("ACCESS_KEY_ID", oss.access_key_id.clone()),
        ("ACCESS_KEY_SECRET", oss.access_key_secret.clone()),
        ("BUCKET", oss.bucket.clone()),
        ("USE_SSL", oss.use_ssl.to_string()),
        ("REGION", oss.region.clone()),
        ("OSS_AGENT_URL", agent_url),
        ("RESOURCE_ID", oss.resource_id.clone()),
        ("X_SECRET", ctx.node_token.clone()),
        ("X_NODENAME", ctx.node_name.clone()),
    ]
}

fn master_vars(worker: &WorkerRecord, ctx: &GeneratorContext) -> Vec<(&'static str, String)> {
    vec![
        ("WORKER_UID", worker.uid.clone()),
        ("MASTER_ENDPOINT", ctx.master_endpoint.clone()),
        ("X_SECRET", ctx.node_token.clone()),
        ("X_NODENAME", ctx.node_name.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup(WORKER_BUILDERS, "pgsql").map(|b| b.kind), Some("pgsql"));
        assert_eq!(
            lookup(EXTENSION_BUILDERS, "ai").map(|b| b.style),
            Some(BuilderStyle::Extension)
        );
        assert!(lookup(EXTENSION_BUILDERS, "telepathy").is_none());
    }

    #[test]
    fn test_sql_resource_rewrites_to_client_port() {
        let plain = SqlBinding {
            host: "db.internal".to_string(),
            port: 5432,
            ..Default::default()
        };
        let vars = sql_vars(&plain, 35432);
        assert_eq!(vars[0], ("HOST", "db.internal".to_string()));
        assert_eq!(vars[1], ("PORT", "5432".to_string()));

        let managed = SqlBinding {
            resource_id: "db1".to_string(),
            ..plain
        };
        let vars = sql_vars(&managed, 35432);
        assert_eq!(vars[0], ("HOST", "localhost".to_string()));
        assert_eq!(vars[1], ("PORT", "35432".to_string()));
    }
}
