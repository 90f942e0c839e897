// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging macros
//
// Every level takes either a ready message or a format string:
//
//     log_info!(logger, Facility::Hello, "PIM: neighbor up");
//     log_info!(logger, Facility::Hello, "PIM: neighbor {} up on {}", addr, iface);

#[doc(hidden)]
#[macro_export]
macro_rules! __pim_log {
    ($method:ident, $logger:expr, $facility:expr, $msg:expr) => {
        $logger.$method($facility, $msg)
    };
    ($method:ident, $logger:expr, $facility:expr, $fmt:literal, $($arg:tt)+) => {
        $logger.$method($facility, &format!($fmt, $($arg)+))
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $facility:expr, $($msg:tt)+) => {
        $crate::__pim_log!(error, $logger, $facility, $($msg)+)
    };
}

#[macro_export]
macro_rules! log_warning {
    ($logger:expr, $facility:expr, $($msg:tt)+) => {
        $crate::__pim_log!(warning, $logger, $facility, $($msg)+)
    };
}

#[macro_export]
macro_rules! log_notice {
    ($logger:expr, $facility:expr, $($msg:tt)+) => {
        $crate::__pim_log!(notice, $logger, $facility, $($msg)+)
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $facility:expr, $($msg:tt)+) => {
        $crate::__pim_log!(info, $logger, $facility, $($msg)+)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $facility:expr, $($msg:tt)+) => {
        $crate::__pim_log!(debug, $logger, $facility, $($msg)+)
    };
}

/// Log with up to two key/value pairs attached to the entry
///
/// ```ignore
/// log_kv!(logger, Severity::Info, Facility::Register, "Register-Stop sent",
///         "source" => "10.0.0.1", "group" => "239.1.1.1");
/// ```
#[macro_export]
macro_rules! log_kv {
    ($logger:expr, $severity:expr, $facility:expr, $msg:expr, $($key:expr => $value:expr),+) => {{
        let kvs: &[(&str, &str)] = &[$(($key, $value)),+];
        $logger.log_kv($severity, $facility, $msg, kvs)
    }};
}
