use log::SetLoggerError;

/// Attempt to init an env_logger for the recycler.
/// Does nothing if the "builtin_env_logger" feature is disabled.
///
/// The filter is read from `RUST_LOG` and defaults to `info`, so collection
/// phase transitions (`debug`) and per-block sweep decisions (`trace`) stay
/// quiet unless asked for.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            )
        } else {
            Ok(())
        }
    }
}
