//! Built-in logger bootstrap, mirroring the teacher's `builtin_env_logger`
//! feature: a host binary gets sensible `env_logger` output for free, while
//! a VM binding that owns its own logging pipeline can disable the default
//! feature and install its own [`log::Log`] implementation instead.

#[cfg(feature = "builtin_env_logger")]
pub fn init() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .try_init();
    });
}

#[cfg(not(feature = "builtin_env_logger"))]
pub fn init() {
    // The embedding VM is responsible for installing a `log::Log`.
}
