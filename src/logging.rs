//! Inicialização do `tracing` para o binário.
//!
//! O filtro vem de `RUST_LOG`; sem ele, `info` (ou `debug` com `--verbose`).
//! Os logs vão para stderr para não misturar com o JSON impresso em stdout.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Diretiva padrão quando `RUST_LOG` não está definida.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "info,inkflow=debug" } else { "warn,inkflow=info" }
}

pub fn init_tracing(verbose: bool, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
