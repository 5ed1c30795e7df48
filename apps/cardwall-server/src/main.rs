use cardwall_events::Bus;
use cardwall_kernel::Kernel;
use cardwall_server::{config, router, telemetry, AppState};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    telemetry::init();

    let mut port = config::default_port();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let Some(value) = args.next().and_then(|v| v.parse().ok()) else {
                    eprintln!("error: --port takes a number");
                    std::process::exit(2);
                };
                port = value;
            }
            other => {
                eprintln!("error: unknown argument {other}");
                std::process::exit(2);
            }
        }
    }

    let state_dir = config::state_dir();
    let kernel = match Kernel::open(&state_dir) {
        Ok(kernel) => kernel,
        Err(err) => {
            eprintln!("error: open state dir {}: {err}", state_dir.display());
            std::process::exit(2);
        }
    };
    let bus = Bus::new_with_replay(256, 256);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: bind port {port}: {err}");
            std::process::exit(2);
        }
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
    let state = AppState::new(bus, kernel, shutdown_tx, port);
    let app = router::build_router().with_state(state);

    info!(port, state_dir = %state_dir.display(), "display service listening");
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::select! {
            _ = shutdown_signal() => {},
            _ = shutdown_rx.changed() => {},
        }
        info!("shutting down");
    });
    if let Err(err) = server.await {
        error!(%err, "http server exited with error");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
