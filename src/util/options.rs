use crate::util::constants::{BYTES_IN_ALLOCATION_GRANULARITY, BYTES_IN_MBYTE};

fn always_valid<T>(_: &T) -> bool {
    true
}

fn is_ratio(v: &f64) -> bool {
    (0.0..=1.0).contains(v)
}

/// Parallel mark helpers: one fewer than the number of cores, at most three.
fn default_parallel_mark_threads() -> usize {
    num_cpus::get().saturating_sub(1).min(MAX_PARALLEL_MARK_THREADS)
}

fn default_max_heap_size() -> usize {
    crate::util::os::memory::get_system_total_memory()
        .map(|total| total as usize)
        .unwrap_or(usize::MAX)
}

/// Upper bound on helper threads during a parallel mark.
pub const MAX_PARALLEL_MARK_THREADS: usize = 3;

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($(#[$outer])* $name: $type[$validator] = $default),*);
    ];
    ($($(#[$outer:meta])* $name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        /// Tunables for one recycler. Read from `RECYCLER_*` environment variables
        /// when constructed with `Default`, and settable by name afterwards.
        #[derive(Clone, Debug)]
        pub struct Options {
            $($(#[$outer])* pub $name: $type),*
        }
        impl Options {
            /// Set an option by its snake-case name. Returns false if the value
            /// cannot be parsed or is rejected by the validator, in which case
            /// the option keeps its old value.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}", s);
                        false
                    }
                }
            }

            fn new_without_env() -> Self {
                Options {
                    $($name: $default),*
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Self::new_without_env();

                // If we have env vars that start with RECYCLER_ and match any option (such as RECYCLER_PARTIAL_COLLECT),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "RECYCLER_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    /// Run the mark phase on the background thread when the caller asks for a concurrent collection.
    concurrent_collect:                    bool  [always_valid] = true,
    /// Sweep non-finalizable buckets on the background thread.
    concurrent_sweep:                      bool  [always_valid] = true,
    /// Let the mutator allocate from blocks the background sweeper has already finished.
    concurrent_sweep_alloc:                bool  [always_valid] = true,
    /// Allow partial (touched-blocks-only) collections.
    partial_collect:                       bool  [always_valid] = true,
    /// Helper threads used during an in-thread mark.
    parallel_mark_threads:                 usize [|v: &usize| *v <= MAX_PARALLEL_MARK_THREADS] = default_parallel_mark_threads(),
    /// Only split the mark stack across helpers when it holds at least this many chunks.
    parallel_mark_min_chunks:              usize [|v: &usize| *v > 0] = 2,
    /// Trigger a collection from the allocation slow path.
    collect_on_allocation:                 bool  [always_valid] = true,
    /// A time-gated collection request is ignored if the previous collection finished less than this long ago.
    collect_time_interval_ms:              u64   [always_valid] = 1000,
    /// Lower bound of the new-page trigger. Also the initial trigger.
    min_uncollected_new_page_count:        usize [|v: &usize| *v > 0] = 1024,
    /// Upper bound of the new-page trigger.
    max_uncollected_new_page_count:        usize [|v: &usize| *v > 0] = 16 * 1024,
    /// Allocation volume since the last collection that triggers one regardless of page growth.
    max_uncollected_alloc_bytes:           usize [|v: &usize| *v > 0] = 256 * BYTES_IN_MBYTE,
    /// A partial collection is only attempted if rescanning dirty cards costs at most this many bytes.
    partial_collect_max_rescan_bytes:      usize [always_valid] = 5 * BYTES_IN_MBYTE,
    /// A partial collection is only attempted if at most this many free bytes sit unused in blocks retired by earlier partial collections.
    partial_collect_max_unused_free_bytes: usize [always_valid] = 16 * BYTES_IN_MBYTE,
    /// Freed bytes per allocated byte below which partial mode is abandoned.
    partial_collect_min_efficacy:          f64   [is_ratio] = 0.1,
    /// During a partial collection, touched blocks with a lower free ratio than this are not reused.
    partial_collect_reuse_min_free_ratio:  f64   [is_ratio] = 0.25,
    /// Maximum number of mark stack chunks. Zero means unbounded.
    mark_stack_max_chunks:                 usize [always_valid] = 0,
    /// How many times marking is restarted after running out of mark stack before giving up.
    mark_oom_max_retries:                  usize [|v: &usize| *v > 0] = 8,
    /// Heap limit in bytes. Allocation fails with `HeapOutOfMemory` beyond it.
    max_heap_size:                         usize [|v: &usize| *v > 0] = default_max_heap_size(),
    /// Free pages kept committed by the page allocator. Beyond this they are decommitted.
    max_free_page_count:                   usize [always_valid] = 1024,
    /// Empty blocks each bucket keeps (with their pages) after a full collection.
    empty_block_retention:                 usize [always_valid] = 4,
    /// Size of the up-front reservation for custom-heap allocations. Zero disables the region.
    pre_reserved_region_size:              usize [|v: &usize| *v % BYTES_IN_ALLOCATION_GRANULARITY == 0] = 256 * BYTES_IN_MBYTE,
    /// Commit custom-heap pages executable first and then re-protect them.
    code_integrity_guard:                  bool  [always_valid] = false,
    /// Conservatively scan the mutator stack and registers for roots.
    scan_stack:                            bool  [always_valid] = false,
    /// Bound on how long the allocation slow path waits for an in-progress concurrent collection.
    concurrent_wait_timeout_ms:            u64   [always_valid] = 1000,
}

impl Options {
    /// Options without any environment variable applied. Used by tests that
    /// need deterministic defaults.
    pub fn fixed_defaults() -> Self {
        Self::new_without_env()
    }

    /// Set an option from a camel-case name (`partialCollect`), the spelling hosts
    /// tend to use on their command lines.
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        let result = self.set_from_str(sr.as_str(), val);
        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }

    /// Set several options from a whitespace separated `name=value` list.
    /// Returns false if any of them failed.
    pub fn set_bulk_from_command_line(&mut self, options: &str) -> bool {
        let mut all_ok = true;
        for opt in options.split_ascii_whitespace() {
            match opt.split_once('=') {
                Some((key, val)) => all_ok &= self.set_from_str(key, val),
                None => {
                    warn!("Malformed option {:?}, expected name=value", opt);
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    /// Concurrent sweep is never combined with a partial collection.
    pub fn concurrent_sweep_for(&self, partial: bool) -> bool {
        self.concurrent_sweep && !partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::{serial_test, with_cleanup};

    #[test]
    fn no_env_var() {
        serial_test(|| {
            let options = Options::default();
            assert_eq!(options.partial_collect_max_rescan_bytes, 5 * BYTES_IN_MBYTE);
            assert_eq!(
                options.partial_collect_max_unused_free_bytes,
                16 * BYTES_IN_MBYTE
            );
            assert!(options.parallel_mark_threads <= MAX_PARALLEL_MARK_THREADS);
        })
    }

    #[test]
    fn with_valid_env_var() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("RECYCLER_PARTIAL_COLLECT", "false");

                    let options = Options::default();
                    assert!(!options.partial_collect);
                },
                || {
                    std::env::remove_var("RECYCLER_PARTIAL_COLLECT");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_value() {
        serial_test(|| {
            with_cleanup(
                || {
                    // Out of range for a ratio, so the default stays.
                    std::env::set_var("RECYCLER_PARTIAL_COLLECT_MIN_EFFICACY", "1.5");

                    let options = Options::default();
                    assert_eq!(options.partial_collect_min_efficacy, 0.1);
                },
                || {
                    std::env::remove_var("RECYCLER_PARTIAL_COLLECT_MIN_EFFICACY");
                },
            )
        })
    }

    #[test]
    fn with_invalid_env_var_key() {
        serial_test(|| {
            with_cleanup(
                || {
                    std::env::set_var("RECYCLER_ABC", "42");

                    let options = Options::default();
                    assert_eq!(options.mark_oom_max_retries, 8);
                },
                || {
                    std::env::remove_var("RECYCLER_ABC");
                },
            )
        })
    }

    #[test]
    fn parallel_threads_are_capped() {
        let mut options = Options::fixed_defaults();
        assert!(!options.set_from_str("parallel_mark_threads", "4"));
        assert!(options.set_from_str("parallel_mark_threads", "3"));
        assert_eq!(options.parallel_mark_threads, 3);
    }

    #[test]
    fn camelcase_and_bulk() {
        let mut options = Options::fixed_defaults();
        assert!(options.set_from_camelcase_str("concurrentSweepAlloc", "false"));
        assert!(!options.concurrent_sweep_alloc);
        assert!(options.set_bulk_from_command_line(
            "scan_stack=true partial_collect_max_rescan_bytes=1024"
        ));
        assert!(options.scan_stack);
        assert_eq!(options.partial_collect_max_rescan_bytes, 1024);
        assert!(!options.set_bulk_from_command_line("scan_stack"));
    }

    #[test]
    fn pre_reserved_size_must_be_granular() {
        let mut options = Options::fixed_defaults();
        assert!(!options.set_from_str("pre_reserved_region_size", "4097"));
        assert!(options.set_from_str(
            "pre_reserved_region_size",
            &(BYTES_IN_ALLOCATION_GRANULARITY * 4).to_string()
        ));
    }
}
