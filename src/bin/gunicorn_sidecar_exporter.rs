//! Binary entrypoint. Deliberately a plain synchronous `main`, not
//! `#[tokio::main]`: [`gunicorn_sidecar_exporter::server::master::run`] must
//! fork its workers before any Tokio runtime exists, and an attribute macro
//! that spins up a runtime before `main`'s body runs would defeat that.

fn main() -> anyhow::Result<()> {
    let (config, verbosity) = gunicorn_sidecar_exporter::cli::parse()?;
    gunicorn_sidecar_exporter::server::master::run(config, verbosity)
}
