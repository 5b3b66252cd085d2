//! Tunables (§6), as a validated table with environment-variable overrides.
//!
//! Modeled on the teacher's `util::options::options!` macro: each field is
//! declared once with its default, an optional environment variable name,
//! and a validator closure; [`Options::read_env_var_settings`] applies
//! overrides found in the process environment at collector start-up.

macro_rules! options {
    ($($(#[$attr:meta])* $name:ident: $type:ty [env_var: $env_var:expr] [$validator:expr] = $default:expr),* $(,)?) => {
        #[derive(Debug, Clone)]
        pub struct Options {
            $($(#[$attr])* pub $name: $type),*
        }

        impl Default for Options {
            fn default() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }

        impl Options {
            /// Scan the process environment for `GNARL_<NAME>` overrides,
            /// validating each before accepting it. An invalid value is
            /// logged and ignored, leaving the existing value in place.
            pub fn read_env_var_settings(&mut self) {
                $(
                    if $env_var {
                        let key = format!("GNARL_{}", stringify!($name).to_uppercase());
                        if let Ok(val) = std::env::var(&key) {
                            match val.parse::<$type>() {
                                Ok(parsed) if ($validator)(&parsed) => {
                                    log::debug!("option {key} overridden to {parsed:?} from environment");
                                    self.$name = parsed;
                                }
                                Ok(parsed) => {
                                    log::warn!("option {key}={parsed:?} failed validation, ignoring");
                                }
                                Err(_) => {
                                    log::warn!("option {key}={val:?} could not be parsed, ignoring");
                                }
                            }
                        }
                    }
                )*
            }
        }
    };
}

fn always_valid<T>(_: &T) -> bool {
    true
}

fn nonzero_usize(v: &usize) -> bool {
    *v > 0
}

/// `totalmem / cpus / 2` at start-up, the same quantity the teacher's
/// `Memory::get_system_total_memory` feeds into its own options defaults
/// (`util/os/memory.rs`). Loading only the memory refresh kind keeps
/// `sysinfo`'s start-up cost low; falls back to a fixed multiple of the
/// default interval if the OS query comes back empty.
fn default_max_collect_interval() -> usize {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};
    let sys = System::new_with_specifics(RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()));
    let total_mem = sys.total_memory() as usize;
    if total_mem == 0 {
        return crate::constants::DEFAULT_COLLECT_INTERVAL * 8;
    }
    let cpus = num_cpus::get().max(1);
    (total_mem / cpus / 2).max(crate::constants::DEFAULT_COLLECT_INTERVAL)
}

options! {
    /// `threads`: size of the marker-thread pool used to drain C5/C6
    /// during a parallel mark phase. Defaults to the number of logical
    /// CPUs, mirroring the teacher's `threads` option.
    threads: usize [env_var: true] [nonzero_usize] = num_cpus::get().max(1),

    /// `default_collect_interval`: initial allocation budget (bytes)
    /// between automatic cycles.
    default_collect_interval: usize [env_var: true] [nonzero_usize]
        = crate::constants::DEFAULT_COLLECT_INTERVAL,

    /// `max_collect_interval`: upper clamp on the auto-tuned interval.
    /// Auto-tuned at start-up to `totalmem / cpus / 2`, the way the
    /// teacher derives it; callers may still override via env var.
    max_collect_interval: usize [env_var: true] [nonzero_usize]
        = default_max_collect_interval(),

    /// `max_total_memory`: soft ceiling. Once live bytes exceed this,
    /// every cycle becomes a full sweep.
    max_total_memory: u64 [env_var: true] [always_valid] = u64::MAX,

    /// Number of sweeps a young object survives before promotion.
    promote_age: u8 [env_var: true] [always_valid] = crate::constants::PROMOTE_AGE,

    /// Disable automatic collection entirely (mirrors a mutator calling
    /// `enable(false)` at start-up, but process-wide and for testing).
    disable_gc: bool [env_var: true] [always_valid] = false,
}

impl Options {
    pub fn new() -> Self {
        let mut opts = Options::default();
        opts.read_env_var_settings();
        opts
    }
}
