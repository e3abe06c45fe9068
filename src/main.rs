use std::sync::Arc;

use epc_mailer::channels::mailbox::ImapMailbox;
use epc_mailer::channels::smtp::SmtpDelivery;
use epc_mailer::config::ServiceConfig;
use epc_mailer::error::Result;
use epc_mailer::pipeline::converter_command::CommandConverter;
use epc_mailer::pipeline::driver::PipelineDriver;

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  required: IMAP_HOST IMAP_USER IMAP_PASSWORD SMTP_HOST SMTP_USER SMTP_PASSWORD");
        std::process::exit(1);
    });

    eprintln!("📬 epc-mailer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   IMAP: {}:{} ({})",
        config.mailbox.host, config.mailbox.port, config.mailbox.folder
    );
    eprintln!(
        "   SMTP: {}:{} (starttls: {})",
        config.delivery.host, config.delivery.port, config.delivery.starttls
    );
    eprintln!("   Converter: {}", config.converter.program);
    eprintln!("   Poll every {}s\n", config.retry.poll_interval.as_secs());

    let delivery = SmtpDelivery::new(&config.delivery)?;
    let converter = CommandConverter::new(
        config.converter.clone(),
        tokio::runtime::Handle::current(),
    );
    let own_address = delivery.sender_address();
    let driver = Arc::new(
        PipelineDriver::new(
            Arc::new(ImapMailbox::new(config.mailbox.clone())),
            Arc::new(delivery),
            Arc::new(converter),
            own_address,
        )
        .with_retry(config.retry.clone())
        .with_empty_message_policy(config.empty_message),
    );

    let mut handle = tokio::spawn(Arc::clone(&driver).run_forever());

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, finishing current message");
            driver.request_shutdown();
            handle.await?;
        }
        res = &mut handle => res?,
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
