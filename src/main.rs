use flowmesh::config::CONFIG;
use flowmesh::demo::{run_pg_restore, run_squares};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    // Los registros del facade `log` también pasan por el subscriber
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
                                  .with(tracing_subscriber::fmt::layer().without_time())
                                  .init();
}

#[tokio::main]
async fn main() {
    // Cargar variables de entorno desde .env si existe (antes de leer CONFIG)
    let _ = dotenvy::dotenv();
    init_tracing();
    let config = &*CONFIG;

    println!("--- Demo flowmesh.squares ---");
    match run_squares(config.demo_values.clone()).await {
        Ok(report) => {
            println!("[SQUARES] valores={:?} cuadrados={:?}", config.demo_values, report.squares);
            println!("[SQUARES] atendidos={} transferencias={}", report.served, report.transfers);
        }
        Err(e) => eprintln!("[SQUARES] Error: {e}"),
    }

    if config.run_pg_demo {
        match run_pg_restore(config).await {
            Ok(live) => println!("[PG DEMO] flows vivos tras restaurar: {live}"),
            Err(e) => eprintln!("[PG DEMO] Error: {e}"),
        }
    } else {
        eprintln!("[PG DEMO] Skipping (set FLOWMESH_RUN_PG_DEMO=1 to enable)");
    }
}
