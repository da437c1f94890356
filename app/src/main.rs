use pgdeck_core::profiles::{FileProfilesStore, ProfilesError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn run_app(
    load_profiles: impl FnOnce() -> Result<FileProfilesStore, ProfilesError>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = load_profiles()?;
    if store.profiles().is_empty() {
        println!(
            "no connection profiles configured (looked at {})",
            store.path().display()
        );
        return Ok(());
    }

    for profile in store.profiles() {
        println!(
            "{}  {}@{}:{}/{}",
            profile.id, profile.user, profile.host, profile.port, profile.database
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    run_app(FileProfilesStore::load_default)
}
