use chrono::Local;
use std::fmt;
use std::time::Duration;

fn emit(level: &str, args: fmt::Arguments) {
    let now = Local::now();
    println!("[{}] {} {}", now.format("%Y-%m-%d %H:%M:%S"), level, args);
}

pub fn info(args: fmt::Arguments) {
    emit("INFO", args)
}

pub fn warn(args: fmt::Arguments) {
    emit("WARN", args)
}

pub fn error(args: fmt::Arguments) {
    emit("ERROR", args)
}

/// Human readable duration for log lines, e.g. `1.25 s`, `340 ms`, `12 us`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 3600.0 {
        format!("{:.2} h", secs / 3600.0)
    } else if secs >= 60.0 {
        format!("{:.2} min", secs / 60.0)
    } else if secs >= 1.0 {
        format!("{:.2} s", secs)
    } else if elapsed.as_millis() > 0 {
        format!("{} ms", elapsed.as_millis())
    } else {
        format!("{} us", elapsed.as_micros())
    }
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logger::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logger::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logger::error(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::format_elapsed;
    use std::time::Duration;

    #[test]
    fn elapsed_picks_unit_by_magnitude() {
        assert_eq!(format_elapsed(Duration::from_micros(12)), "12 us");
        assert_eq!(format_elapsed(Duration::from_millis(340)), "340 ms");
        assert_eq!(format_elapsed(Duration::from_millis(1250)), "1.25 s");
        assert_eq!(format_elapsed(Duration::from_secs(90)), "1.50 min");
        assert_eq!(format_elapsed(Duration::from_secs(5400)), "1.50 h");
    }
}
