use bike_beacon_tracker::app::{Options, RunError, run_with_io};
use bike_beacon_tracker::location::StaticLocation;
use bike_beacon_tracker::scanner::open_radio;
use bike_beacon_tracker::trip::remote::TripService;
use clap::Parser;
use log::{error, warn};
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[cfg(feature = "http")]
fn trip_service(options: &Options) -> Result<Option<Arc<dyn TripService>>, RunError> {
    use bike_beacon_tracker::trip::http::HttpTripService;

    let Some(url) = options.api_url.as_deref() else {
        return Ok(None);
    };
    log::info!("using trip backend at {url}");
    let service = HttpTripService::new(url, options.auth_token.clone(), options.request_timeout)?;
    Ok(Some(Arc::new(service)))
}

#[cfg(not(feature = "http"))]
fn trip_service(options: &Options) -> Result<Option<Arc<dyn TripService>>, RunError> {
    if options.api_url.is_some() {
        warn!("built without the http feature, ignoring --api-url");
    }
    Ok(None)
}

async fn run(options: Options) -> Result<(), RunError> {
    let service = trip_service(&options)?;
    let location = Arc::new(StaticLocation::new(options.last_known_position));
    let radio = open_radio(options.backend).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    let mut stdout = std::io::stdout().lock();
    run_with_io(options, radio, service, location, &mut stdout, shutdown).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    dotenv::dotenv().ok();
    let options = Options::parse();

    let default_level = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(options).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{why}");
            std::process::exit(EXIT_ERROR);
        }
    }
}
