use bmp_rib::{BmpSettings, Provider};
use foundations::cli::Cli;
use foundations::settings::settings;
use foundations::telemetry::settings::TelemetrySettings;
use foundations::telemetry::{self, log};
use foundations::BootstrapResult;

#[settings]
struct CollectorSettings {
    /// Telemetry settings.
    telemetry: TelemetrySettings,
    /// BMP collector settings.
    bmp: BmpSettings,
}

#[tokio::main]
async fn main() -> BootstrapResult<()> {
    let service_info = foundations::service_info!();
    let cli = Cli::<CollectorSettings>::new(&service_info, vec![])?;
    let telemetry_driver =
        telemetry::init_with_server(&service_info, &cli.settings.telemetry, vec![])?;

    let provider = Provider::new(&cli.settings.bmp)?;
    let listen = provider.start().await?;
    log::info!("BMP collector started"; "listen" => %listen);

    tokio::select! {
        res = telemetry_driver => res?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, stopping");
        }
        _ = provider.stopping() => {
            log::error!("BMP collector stopped on error");
        }
    }
    provider.stop().await;
    Ok(())
}
