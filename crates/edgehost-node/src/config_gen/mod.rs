// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sandbox configuration generation.
//!
//! A worker's configuration is rendered from its binding declaration:
//!
//! ```text
//! WorkerRecord ──► TemplateSource ──► WorkerDeclaration ──► builders ──► workerd.capnp
//!                  (master enriches;        │                  │
//!                   local template          └─ services ──► PeerResolver
//!                   on failure)
//! ```
//!
//! Rendering is deterministic: the same record, declaration and peers always
//! produce byte-identical output.

pub mod builders;
pub mod declaration;
pub mod enrich;
pub mod template;

pub use self::builders::PeerWorker;
pub use self::declaration::WorkerDeclaration;
pub use self::enrich::{RemoteTemplateSource, TemplateEnricher, TemplateSource};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use edgehost_agent_sdk::WorkerRecord;
use edgehost_agent_sdk::auth::node_token;
use minijinja::{Environment, context};
use tracing::{debug, info, warn};

use crate::artifacts::WorkerArtifacts;
use crate::config::{ClientPorts, Config};
use crate::error::Result;
use crate::ports::PortAllocator;
use crate::store::WorkerStore;

/// Node-level values baked into every generated configuration.
#[derive(Debug, Clone)]
pub struct GeneratorContext {
    /// This node's name.
    pub node_name: String,
    /// This node's token, handed to shims calling back into the fleet.
    pub node_token: String,
    /// Cluster secret, for service tokens.
    pub cluster_secret: String,
    /// Master base URL; our own endpoint when we are the master.
    pub master_endpoint: String,
    /// Port of this node's HTTP API.
    pub api_port: u16,
    /// Host worker sockets bind to.
    pub worker_host: String,
    /// Local ports tunnelling to managed resources.
    pub client_ports: ClientPorts,
}

impl GeneratorContext {
    /// Derive the context from node configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_name: config.node_name.clone(),
            node_token: node_token(&config.node_name, &config.cluster_secret),
            cluster_secret: config.cluster_secret.clone(),
            master_endpoint: config
                .master_endpoint
                .clone()
                .unwrap_or_else(|| config.advertise_endpoint.clone()),
            api_port: config.http_addr.port(),
            worker_host: config.worker_host.clone(),
            client_ports: config.client_ports,
        }
    }
}

/// Resolves worker names used as service bindings.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    /// The peer named `name`, if it exists and has a port.
    async fn resolve(&self, name: &str) -> Result<Option<PeerWorker>>;
}

/// Resolves peers through the worker store and the port allocator.
pub struct StorePeerResolver {
    workers: Arc<dyn WorkerStore>,
    ports: Arc<dyn PortAllocator>,
}

impl StorePeerResolver {
    /// Resolver over `workers` and `ports`.
    pub fn new(workers: Arc<dyn WorkerStore>, ports: Arc<dyn PortAllocator>) -> Self {
        Self { workers, ports }
    }
}

#[async_trait]
impl PeerResolver for StorePeerResolver {
    async fn resolve(&self, name: &str) -> Result<Option<PeerWorker>> {
        let Some(worker) = self.workers.get_worker_by_name(name).await? else {
            return Ok(None);
        };
        Ok(self
            .ports
            .get_port(&worker.uid)
            .await
            .map(|port| PeerWorker { uid: worker.uid, port }))
    }
}

/// A rendered configuration and the shims it embeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedConfig {
    /// Configuration text.
    pub text: String,
    /// Shim scripts by extension type.
    pub shims: BTreeMap<&'static str, &'static str>,
}

/// Renders and writes sandbox configurations.
pub struct ConfigGenerator {
    ctx: GeneratorContext,
    env: Environment<'static>,
    templates: Arc<dyn TemplateSource>,
    peers: Arc<dyn PeerResolver>,
    ports: Arc<dyn PortAllocator>,
    artifacts: WorkerArtifacts,
}

impl ConfigGenerator {
    /// Create a generator.
    ///
    /// # Panics
    ///
    /// Panics if a built-in template is malformed.
    pub fn new(
        ctx: GeneratorContext,
        templates: Arc<dyn TemplateSource>,
        peers: Arc<dyn PeerResolver>,
        ports: Arc<dyn PortAllocator>,
        artifacts: WorkerArtifacts,
    ) -> Self {
        Self {
            ctx,
            env: template::environment(),
            templates,
            peers,
            ports,
            artifacts,
        }
    }

    /// Generator context.
    pub fn context(&self) -> &GeneratorContext {
        &self.ctx
    }

    /// Resolve the declaration of `worker`, preferring the enriched one.
    pub async fn declaration(&self, worker: &WorkerRecord) -> WorkerDeclaration {
        let text = match self.templates.fill_worker_config(worker).await {
            Ok(text) => text,
            Err(e) => {
                warn!(worker_uid = %worker.uid, error = %e, "Enriched declaration unavailable, using local template");
                worker.template.clone()
            }
        };
        WorkerDeclaration::parse_or_default(&text)
    }

    /// Render the configuration of `worker`.
    ///
    /// Claims the worker's socket port if it has none yet.
    pub async fn generate(&self, worker: &WorkerRecord) -> Result<GeneratedConfig> {
        let declaration = self.declaration(worker).await;

        let mut peers = BTreeMap::new();
        for service in &declaration.services {
            if peers.contains_key(service) {
                continue;
            }
            match self.peers.resolve(service).await {
                Ok(Some(peer)) => {
                    peers.insert(service.clone(), peer);
                }
                Ok(None) => {}
                Err(e) => warn!(worker_uid = %worker.uid, service = %service, error = %e, "Peer lookup failed"),
            }
        }

        let port = self.ports.claim_port(&worker.uid).await?;
        self.render(worker, &declaration, port, &peers)
    }

    /// Render a configuration from already-resolved inputs.
    pub fn render(
        &self,
        worker: &WorkerRecord,
        declaration: &WorkerDeclaration,
        port: u16,
        peers: &BTreeMap<String, PeerWorker>,
    ) -> Result<GeneratedConfig> {
        let fragments = builders::build_fragments(&self.env, &self.ctx, worker, declaration, peers)?;

        let text = self.env.get_template(template::MAIN)?.render(context! {
            uid => worker.uid,
            entry => worker.entry,
            address => format!("{}:{}", self.ctx.worker_host, port),
            compatibility_date => template::COMPATIBILITY_DATE,
            flags => declaration.compatibility_flags,
            services => fragments.services,
            sockets => fragments.sockets,
            extensions => fragments.extensions,
            bindings => fragments.bindings,
            declarations => fragments.declarations,
        })?;

        Ok(GeneratedConfig {
            text,
            shims: fragments.shims,
        })
    }

    /// Generate and write the configuration of `worker`, plus any missing shims.
    pub async fn write(&self, worker: &WorkerRecord) -> Result<PathBuf> {
        let generated = self.generate(worker).await?;

        for (kind, script) in &generated.shims {
            if self.artifacts.write_shim_if_absent(kind, script).await? {
                debug!(kind = %kind, "Wrote shim");
            }
        }

        let path = self.artifacts.write_config(&worker.uid, &generated.text).await?;
        info!(worker_uid = %worker.uid, path = %path.display(), "Wrote sandbox configuration");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ports::InMemoryPortAllocator;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct FailingSource;

    #[async_trait]
    impl TemplateSource for FailingSource {
        async fn fill_worker_config(&self, _worker: &WorkerRecord) -> Result<String> {
            Err(Error::Other("master unreachable".to_string()))
        }
    }

    fn ctx() -> GeneratorContext {
        GeneratorContext {
            node_name: "edge-1".to_string(),
            node_token: node_token("edge-1", "secret"),
            cluster_secret: "secret".to_string(),
            master_endpoint: "http://master:8888".to_string(),
            api_port: 8888,
            worker_host: "localhost".to_string(),
            client_ports: ClientPorts::default(),
        }
    }

    fn generator(dir: &std::path::Path) -> (ConfigGenerator, Arc<MemoryStore>, Arc<InMemoryPortAllocator>) {
        let store = Arc::new(MemoryStore::new());
        let ports = Arc::new(InMemoryPortAllocator::new(20000..=20100));
        let generator = ConfigGenerator::new(
            ctx(),
            Arc::new(FailingSource),
            Arc::new(StorePeerResolver::new(store.clone(), ports.clone())),
            ports.clone(),
            WorkerArtifacts::new(dir),
        );
        (generator, store, ports)
    }

    fn worker(template: serde_json::Value) -> WorkerRecord {
        WorkerRecord {
            uid: "w1".to_string(),
            name: "shop".to_string(),
            node_name: "edge-1".to_string(),
            entry: "entry.js".to_string(),
            template: template.to_string(),
            control_port: 20001,
            ..Default::default()
        }
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    #[tokio::test]
    async fn test_generate_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());
        let record = worker(json!({
            "pgsql": [{"resource_id": "db1", "binding": "DB"}],
            "kv": [{"binding": "CACHE", "host": "redis", "port": 6379}],
            "compatibility_flags": ["nodejs_compat"],
            "vars": {"MODE": "prod"},
        }));

        let first = generator.generate(&record).await.unwrap();
        let second = generator.generate(&record).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_main_worker_and_control_always_present() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());

        let text = generator.generate(&worker(json!({}))).await.unwrap().text;

        assert!(text.contains("(name = \"w1\", worker = .vw1Worker)"));
        assert!(text.contains("address = \"localhost:20000\""));
        assert!(text.contains("esModule = embed \"src/entry.js\""));
        assert!(text.contains("(name = \"control\", worker = .vControl)"));
        assert!(text.contains("address = \"localhost:20001\""));
        assert!(text.contains("bindings = [(name = \"worker\", service = \"w1\"),]"));
    }

    #[tokio::test]
    async fn test_typed_binding_produces_three_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());

        let generated = generator
            .generate(&worker(json!({"pgsql": [{"resource_id": "db1", "binding": "DB", "user": "app"}]})))
            .await
            .unwrap();
        let text = generated.text;

        assert!(text.contains("const vDBExt :Workerd.Worker"));
        assert!(text.contains("(name = \"DBExt\", worker = .vDBExt)"));
        assert!(text.contains("(name = \"DB\", service = \"DBExt\")"));
        assert!(text.contains("(name = \"HOST\", text = \"localhost\")"));
        assert!(text.contains("(name = \"PORT\", text = \"35432\")"));
        assert!(generated.shims.contains_key("pgsql"));
        assert!(generated.shims.contains_key("control"));
    }

    #[tokio::test]
    async fn test_unknown_extension_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());

        let generated = generator
            .generate(&worker(json!({"extensions": [{"name": "telepathy"}, {"name": "ai", "binding": "AI"}]})))
            .await
            .unwrap();

        assert!(!generated.text.contains("telepathy"));
        assert!(generated.text.contains("extensions = [.eai,]"));
        assert!(generated.text.contains("(name = \"AI\", wrapped = (moduleName = \"ai:binding\"))"));
    }

    #[tokio::test]
    async fn test_service_binding_resolves_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, store, ports) = generator(dir.path());
        store
            .upsert_worker(&WorkerRecord {
                uid: "peer".to_string(),
                name: "billing-api".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let peer_port = ports.claim_port("peer").await.unwrap();

        let text = generator
            .generate(&worker(json!({"services": ["billing-api", "missing"]})))
            .await
            .unwrap()
            .text;

        assert!(text.contains("const nbilling_apiNetwork :Workerd.ExternalServer"));
        assert!(text.contains(&format!("address = \"127.0.0.1:{}\"", peer_port)));
        assert!(text.contains("(name = \"x-edgehost-caller-uid\", value = \"w1\")"));
        assert!(text.contains("(name = \"billing_api\", service = \"billing_apiNetwork\")"));
        assert!(!text.contains("missing"));
    }

    #[tokio::test]
    async fn test_vars_rendered_as_json_binding() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());

        let text = generator
            .generate(&worker(json!({"vars": {"MODE": "prod"}})))
            .await
            .unwrap()
            .text;

        assert!(text.contains(r#"(name = "vars", json = "{\"MODE\":\"prod\"}")"#));
    }

    #[tokio::test]
    async fn test_duplicate_binding_names_emit_once() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());

        let text = generator
            .generate(&worker(json!({
                "kv": [{"host": "redis-a"}, {"host": "redis-b"}],
            })))
            .await
            .unwrap()
            .text;

        assert_eq!(text.matches("const vkvExt :Workerd.Worker").count(), 1);
        assert_eq!(text.matches("(name = \"kv\", service = \"kvExt\")").count(), 1);
        assert!(text.contains("(name = \"ENDPOINT\", text = \"redis-a\")"));
        assert!(!text.contains("redis-b"));
    }

    // ========================================================================
    // Writing
    // ========================================================================

    #[tokio::test]
    async fn test_ai_worker_and_extension_use_separate_shims() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());
        let artifacts = WorkerArtifacts::new(dir.path());

        let extension = worker(json!({"extensions": [{"name": "ai"}]}));
        let helper = WorkerRecord {
            uid: "w2".to_string(),
            control_port: 20002,
            ..worker(json!({"ai": [{"binding": "AI"}]}))
        };
        generator.write(&extension).await.unwrap();
        generator.write(&helper).await.unwrap();

        let extension_config = tokio::fs::read_to_string(artifacts.config_path("w1")).await.unwrap();
        assert!(extension_config.contains("embed \"../../lib/ai-ext.js\""));
        let helper_config = tokio::fs::read_to_string(artifacts.config_path("w2")).await.unwrap();
        assert!(helper_config.contains("embed \"../../lib/ai.js\""));

        let extension_shim = tokio::fs::read_to_string(artifacts.shim_path("ai-ext")).await.unwrap();
        assert_eq!(extension_shim, template::AI_EXTENSION_SHIM);
        let helper_shim = tokio::fs::read_to_string(artifacts.shim_path("ai")).await.unwrap();
        assert_eq!(helper_shim, template::AI_SHIM);
    }

    #[tokio::test]
    async fn test_write_creates_config_and_shims() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _, _) = generator(dir.path());
        let artifacts = WorkerArtifacts::new(dir.path());

        let path = generator
            .write(&worker(json!({"kv": [{"binding": "CACHE"}]})))
            .await
            .unwrap();

        assert_eq!(path, artifacts.config_path("w1"));
        assert!(path.exists());
        assert!(artifacts.shim_path("kv").exists());
        assert!(artifacts.shim_path("control").exists());
    }
}
