use tokio::signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Signal {
    #[strum(serialize = "SIGINT")]
    Interrupt,
    #[strum(serialize = "SIGTERM")]
    Terminate,
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownSignalError {
    #[error("failed to install Ctrl+C handler")]
    CtrlC(#[source] std::io::Error),
    #[cfg(unix)]
    #[error("failed to install SIGTERM handler")]
    Sigterm(#[source] std::io::Error),
}

/// Resolve once the process is asked to stop, reporting which signal did it.
pub async fn shutdown_signal() -> Result<Signal, ShutdownSignalError> {
    let ctrl_c = async {
        signal::ctrl_c().await.map_err(ShutdownSignalError::CtrlC)?;
        Ok(Signal::Interrupt)
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(ShutdownSignalError::Sigterm)?;
        sigterm.recv().await;
        Ok(Signal::Terminate)
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<Signal, ShutdownSignalError>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_display_by_name() {
        assert_eq!(Signal::Interrupt.to_string(), "SIGINT");
        assert_eq!(Signal::Terminate.to_string(), "SIGTERM");
    }
}
