/// Agent version reported in heartbeats. Release builds stamp it through the
/// `APP_VERSION` environment variable; local builds fall back to the crate version.
pub const VERSION: &str = match option_env!("APP_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};
