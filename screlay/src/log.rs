// Logging goes through these macros so that the `log` dependency stays optional. Without the
// feature the arguments are still type-checked.
//
// A message can be tied to a link by starting it with `[link]`:
//
//     debug!([self.link] "waiting for round {}", round);
//
// It is then prefixed with the link's name and logged under the link's own target
// (`screlay::link::slave` or `screlay::link::master`), so one side can be filtered on its own.

#[cfg(feature = "log")]
macro_rules! log_at {
    ($level:ident, [$link:expr] $fmt:literal $($args:tt)*) => {{
        let link: crate::link::LinkId = $link;
        log::log!(
            target: link.log_target(),
            log::Level::$level,
            concat!("[{}] ", $fmt),
            link
            $($args)*
        );
    }};
    ($level:ident, $($t:tt)*) => {{ log::log!(log::Level::$level, $($t)*); }};
}

#[cfg(not(feature = "log"))]
macro_rules! log_at {
    ($level:ident, [$link:expr] $fmt:literal $($args:tt)*) => {{
        let link: crate::link::LinkId = $link;
        format_args!(concat!("[{}] ", $fmt), link $($args)*);
    }};
    ($level:ident, $($t:tt)*) => {{ format_args!($($t)*); }};
}

macro_rules! error {
    ($($t:tt)*) => { log_at!(Error, $($t)*) };
}

macro_rules! warn {
    ($($t:tt)*) => { log_at!(Warn, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { log_at!(Info, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { log_at!(Debug, $($t)*) };
}

macro_rules! trace {
    ($($t:tt)*) => { log_at!(Trace, $($t)*) };
}
