//! Binary entry point: wires up a `Config`, a primary session transport, and
//! runs a `Service` to completion. Grounded on the teacher crate's
//! `samples/async-server` wiring of `opcua_server`.

use agentmux::creds::Credentials;
use agentmux::service::{Service, ServiceNotification};
use agentmux::Config;
use log::info;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

mod wiring;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init();

    let config = Config::from_env();
    let creds = Credentials::new(
        std::env::var("USER").unwrap_or_else(|_| "admin".to_string()),
        None,
        "localhost",
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).expect("failed to install SIGINT handler");
    }

    let local = LocalSet::new();
    local
        .run_until(async move {
            let handle_cell = wiring::HandleCell::new();
            let primary_transport = wiring::spawn_primary_transport(&config, handle_cell.clone());
            let transport_factory = wiring::transport_factory(&config, handle_cell.clone());
            let reauthorizer = wiring::reauthorizer();

            let (service, handle, mut notifications) =
                Service::new(config, creds, primary_transport, transport_factory, reauthorizer);
            handle_cell.set(handle.clone());

            let notify_task = tokio::task::spawn_local(async move {
                while let Some(notification) = notifications.recv().await {
                    match notification {
                        ServiceNotification::Idling(true) => info!("service is idling"),
                        ServiceNotification::Idling(false) => info!("service has active callers"),
                        ServiceNotification::Destroy => info!("service destroyed"),
                    }
                }
            });

            let run_task = tokio::task::spawn_local(service.run());

            cancel.cancelled().await;
            info!("signal received, disposing service");
            handle.dispose();

            let _ = run_task.await;
            notify_task.abort();
        })
        .await;
}
