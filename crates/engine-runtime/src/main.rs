//! Minimal wiring binary: builds an in-process process definition, starts
//! an engine backed by either the in-memory or Postgres store depending on
//! `DATABASE_URL`, and runs it to completion. There is no network surface
//! here — correlation and control happen through whatever embeds
//! `engine-core` directly; this binary exists to exercise the wiring path
//! end to end, the same role a `bpmn-lite-server` binary plays in wiring an
//! engine facade before handing it to a transport.

use std::sync::Arc;

use engine_core::dispatcher::Engine;
use engine_core::graph::{Element, ElementKind, ProcessDefinitionBuilder};
use engine_core::ports::Ports;
use engine_core::registries::WaitingRegistries;
use engine_core::store::TokenStore;
use engine_core::store_memory::MemoryTokenStore;
use engine_core::vars::Variables;
use serde_json::Map as JsonMap;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let database_url = parse_database_url();

    let store: Arc<dyn TokenStore> = match database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to Postgres");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = engine_core::store_postgres::PostgresTokenStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresTokenStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("DATABASE_URL set but the postgres feature is not enabled, using MemoryTokenStore");
            Arc::new(MemoryTokenStore::new())
        }
        None => {
            tracing::info!("using MemoryTokenStore (no DATABASE_URL configured)");
            Arc::new(MemoryTokenStore::new())
        }
    };

    let registries = Arc::new(WaitingRegistries::new());
    registries.rehydrate(store.as_ref()).await?;

    let def = Arc::new(demo_definition()?);
    let ports = Arc::new(Ports::null());
    let engine = Engine::new(def, store, registries, ports, 32);

    let mut vars = Variables::new();
    vars.set("orderId", serde_json::json!("demo-1"));
    let instance_id = engine.start_instance(None, vars).await?;
    tracing::info!(%instance_id, "instance started and run to completion");

    Ok(())
}

/// A linear start -> task -> end process, enough to exercise the wiring
/// without a parser on hand (process-definition parsing is out of scope).
fn demo_definition() -> Result<engine_core::graph::ProcessDefinition, Box<dyn std::error::Error>> {
    let mut builder = ProcessDefinitionBuilder::new("demo-process", 1);
    builder.add_element(Element {
        id: "start".into(),
        name: Some("Start".into()),
        kind: ElementKind::StartEvent { event_definitions: vec![] },
        extensions: JsonMap::new(),
    });
    builder.add_element(Element {
        id: "task".into(),
        name: Some("Do work".into()),
        kind: ElementKind::ScriptTask {
            script: "status = \"DONE\"".into(),
        },
        extensions: JsonMap::new(),
    });
    builder.add_element(Element {
        id: "end".into(),
        name: Some("End".into()),
        kind: ElementKind::EndEvent { terminate: false },
        extensions: JsonMap::new(),
    });
    builder.add_flow("f1", "start", "task", None, false);
    builder.add_flow("f2", "task", "end", None, false);
    Ok(builder.build()?)
}

/// Parse the database URL from `--database-url <url>` or `DATABASE_URL`.
fn parse_database_url() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = args.windows(2).find(|w| w[0] == "--database-url").map(|w| w[1].clone()) {
        return Some(url);
    }
    std::env::var("DATABASE_URL").ok()
}
