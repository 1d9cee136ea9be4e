//! Runtime configuration, read once from `NUMASIGHT_*` environment variables.

use crate::util::constants::*;
use std::cell::UnsafeCell;
use std::default::Default;
use std::ops::Deref;

/// An option of a given type, with capability metadata.
#[derive(Debug, Clone)]
pub struct ProfilerOption<T: Clone> {
    pub value: T,

    /// Can we set this option through env vars?
    pub from_env_var: bool,
    /// Can we set this option through the API?
    pub from_command_line: bool,
}

// Dereference an option to get its value.
impl<T: Clone> Deref for ProfilerOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

macro_rules! options {
    // Verify whether we can set an option through env var or command line.
    (@verify_set_from($self: expr, $key: expr, $verify_field: ident, $($name: ident),*)) => {
        match $key {
            $(stringify!($name) => { assert!($self.$name.$verify_field, "cannot set option {} (not {})", $key, stringify!($verify_field)) }),*
            _ => panic!("Invalid Options key")
        }
    };

    ($($name:ident: $type:ty[env_var: $env_var:expr, command_line: $command_line:expr][$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[env_var: $env_var, command_line: $command_line][$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[env_var: $env_var:expr, command_line: $command_line:expr][$validator:expr] = $default:expr),*) => [
        pub struct Options {
            $(pub $name: ProfilerOption<$type>),*
        }
        impl Options {
            /// Set an option from env var
            pub fn set_from_env_var(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_env_var, $($name),*));
                self.set_inner(s, val)
            }

            /// Set an option from the API
            pub fn set_from_command_line(&mut self, s: &str, val: &str) -> bool {
                options!(@verify_set_from(self, s, from_command_line, $($name),*));
                self.set_inner(s, val)
            }

            /// Set an option and run its validator for its value.
            fn set_inner(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name.value = val.clone();
                        } else {
                            eprintln!("Warn: unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        eprintln!("Warn: unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => panic!("Invalid Options key")
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: ProfilerOption {
                        value: $default,
                        from_env_var: $env_var,
                        from_command_line: $command_line,
                    }),*
                };

                // Env vars that start with NUMASIGHT_ and match an option
                // (such as NUMASIGHT_TOP_K) override the default.
                const PREFIX: &str = "NUMASIGHT_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_env_var(lowercase, &val); },)*
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
    // A page is escalated to page-level diagnosis once threads other than its
    // first-touch thread have accessed it more than this many times.
    page_sharing_threshold:  usize  [env_var: true, command_line: true] [|v: &usize| *v > 0] = DEFAULT_PAGE_SHARING_THRESHOLD,
    // A cache line is escalated to a detailed record once it has been written
    // more than this many times.
    cache_sharing_threshold: usize  [env_var: true, command_line: true] [|v: &usize| *v > 0] = DEFAULT_CACHE_SHARING_THRESHOLD,
    // Bound for the diagnosis queues: objects kept per call site, cache lines
    // and pages kept per object.
    top_k:                   usize  [env_var: true, command_line: true] [|v: &usize| *v > 0] = DEFAULT_TOP_K,
    // Where to write the exit report. Empty means stderr.
    report_file:             String [env_var: true, command_line: true] [|_: &String| true] = String::new(),
    // Effective thread id capacity. Threads beyond it share the last id.
    max_threads:             usize  [env_var: true, command_line: true] [|v: &usize| *v > 0 && *v <= MAX_THREAD_NUM] = MAX_THREAD_NUM,
    // A page's first-touch thread is pinned by another object when its
    // page-wide accesses exceed this multiple of its accesses to the object
    // under diagnosis.
    allocator_share_ratio:   usize  [env_var: true, command_line: true] [|v: &usize| *v > 0] = DEFAULT_ALLOCATOR_SHARE_RATIO,
    // Retry budget for droppable counter updates. Negative retries forever.
    counter_retries:         isize  [env_var: true, command_line: true] [|_: &isize| true] = DEFAULT_COUNTER_RETRIES,
}

/// Shared wrapper so tests and the API can adjust options before the engine
/// is published. The caller guarantees no concurrent mutation.
pub struct UnsafeOptionsWrapper {
    inner: UnsafeCell<Options>,
}

unsafe impl Sync for UnsafeOptionsWrapper {}

impl UnsafeOptionsWrapper {
    pub fn new(options: Options) -> Self {
        Self {
            inner: UnsafeCell::new(options),
        }
    }

    /// Set an option by name.
    ///
    /// # Safety
    /// The caller must guarantee no other thread is reading the options.
    pub unsafe fn process(&self, name: &str, value: &str) -> bool {
        (*self.inner.get()).set_from_command_line(name, value)
    }
}

impl Deref for UnsafeOptionsWrapper {
    type Target = Options;
    fn deref(&self) -> &Options {
        unsafe { &*self.inner.get() }
    }
}
