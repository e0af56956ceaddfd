use trace_err::*;

/// Cancels `cancel_token` on SIGTERM or CTRL+C.
pub fn listen_for_cancel(cancel_token: &tokio_util::sync::CancellationToken) {
    #[cfg(unix)]
    let terminate = {
        let mut term_handler =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .trace_expect("Failed to register signal handlers");
        async move {
            term_handler.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let cancel_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate => {
                eprintln!("Received terminate signal, stopping...");
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Received CTRL+C, stopping...");
            }
            _ = cancel_token.cancelled() => {}
        }

        cancel_token.cancel();
    });
}
