use backtrace::Backtrace;
use nix::errno::{errno, Errno};
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

extern "C" fn flush_log_buffer() {
    match LOG_GLOBALS.lock() {
        Ok(mut lock) => {
            lock.log_file.flush().unwrap_or(());
        }
        // Somebody panicked while logging. Nothing sensible left to flush.
        Err(_) => (),
    }
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("RD_LOG_FILE");
        let maybe_append_filename = var_os("RD_APPEND_LOG_FILE");
        let mut f: Box<dyn Write + Send>;
        if let Some(filename) = maybe_filename {
            f = Box::new(File::create(&filename).unwrap_or_else(|e| panic!("Error. Could not create filename `{:?}' specified in environment variable RD_LOG_FILE: {}", filename, e)));
        } else if let Some(append_filename) = maybe_append_filename {
            f = Box::new(OpenOptions::new().append(true).create(true).open(&append_filename).unwrap_or_else(|e| panic!("Error. Could not append to filename `{:?}' specified in env variable RD_APPEND_LOG_FILE: {}", append_filename, e)));
        } else {
            f = Box::new(io::stderr());
        }

        if let Ok(buf_size) = env::var("RD_LOG_BUFFER") {
            let log_buffer_size = buf_size.parse::<usize>().unwrap_or_else(|_| panic!("Error. Could not parse `{:?}' in environment var `RD_LOG_BUFFER' as a number", buf_size));
            f = Box::new(BufWriter::with_capacity(log_buffer_size, f));
        }

        let ret = unsafe { libc::atexit(flush_log_buffer) };
        assert_eq!(ret, 0);

        let (default_level, level_map) = match env::var("RD_LOG") {
            Ok(rd_log) => init_log_levels(&rd_log),
            Err(_) => (LogError, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

/// Parse something like `all:warn,trace_writer:debug`.
fn init_log_levels(rd_log: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogError;
    for mod_colon_level in rd_log.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // We DONT lowercase here as filenames are usually case sensitive on Linux.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

fn filename_to_module_name(filename: &str) -> String {
    match Path::new(filename).file_stem() {
        Some(stem) => stem.to_string_lossy().to_string(),
        None => filename.to_owned(),
    }
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        return log_module.clone();
    }

    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let mut lock = match LOG_GLOBALS.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if !enabled {
            return None;
        }

        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if level == LogDebug {
            write!(stream, "[{}] ", m.name).unwrap_or(());
        } else {
            write_prefix(&mut stream, level, filename, line);
        }

        Some(stream)
    }
}

/// Low level. Use is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str) -> bool {
    let mut lock = match LOG_GLOBALS.lock() {
        Ok(lock) => lock,
        Err(poisoned) => poisoned.into_inner(),
    };
    level <= get_log_module(filename, &mut lock).level
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.message.push(b'\n');
            // Flushes `message` *to* the log file, not the log file itself.
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }

        // Pretend the bytes were written even when disabled, otherwise
        // write!() reports WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap_or(());

    let err = errno();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {:?}", Errno::from_i32(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// This is almost always not the method you want. Use log!() macro instead
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// After this program continues normally.
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            if let Some(mut stream) = $crate::log::log($log_level, file!(), line!(), false) {
                write!(stream, $($args)+).unwrap_or(());
            }
        }
    };
}

macro_rules! is_logging {
    ($log_level:expr) => {
        $crate::log::is_logging($log_level, file!())
    };
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// Prints out the backtrace to stderr and aborts.
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                if let Some(mut stream) =
                    $crate::log::log($crate::log::LogFatal, file!(), line!(), true)
                {
                    write!(stream, $($args)+).unwrap_or(());
                }
            }
            $crate::log::notifying_abort(backtrace::Backtrace::new())
        }
    };
}

/// Output to stderr always. No backtrace -- simply exit.
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            $crate::log::write_prefix(
                &mut std::io::stderr(),
                $crate::log::LogFatal,
                file!(),
                line!(),
            );
            eprintln!($($args)+);
            std::process::exit(1)
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort(bt: Backtrace) -> ! {
    flush_log_buffer();
    dump_rd_stack(bt);
    std::process::abort();
}

fn dump_rd_stack(bt: Backtrace) {
    eprintln!("=== Start rd backtrace:");
    eprintln!("{:?}", bt);
    eprintln!("=== End rd backtrace");
}

/// Run `body` in a copy of the test binary that only runs `test_path`, and
/// check that it dies through `fatal!()`. `test_path` is the full test name,
/// e.g. `concat!(module_path!(), "::my_test")`.
#[cfg(test)]
pub fn assert_fatal<F: FnOnce()>(test_path: &str, body: F) {
    use std::{os::unix::process::ExitStatusExt, process::Command, process::Stdio};
    const CHILD_VAR: &str = "RD_FATAL_TEST_CHILD";

    if env::var_os(CHILD_VAR).is_some() {
        body();
        // Survived. The parent sees a clean exit.
        std::process::exit(0);
    }

    let name = test_path.splitn(2, "::").nth(1).unwrap_or(test_path);
    let status = Command::new(env::current_exe().unwrap())
        .args(&[name, "--exact", "--test-threads=1"])
        .env(CHILD_VAR, "1")
        .env("RD_LOG", "all:fatal")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(
        status.signal(),
        Some(libc::SIGABRT),
        "{} was expected to abort, got {}",
        name,
        status
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_log_levels() {
        let (default_level, hm) = init_log_levels("all:warn, trace_writer:debug,bogus");
        assert_eq!(default_level, LogWarn);
        assert_eq!(hm.len(), 1);
        assert_eq!(hm.get("trace_writer"), Some(&LogDebug));
    }

    #[test]
    fn unknown_level_is_warn() {
        assert_eq!(log_level_string_to_level("chatty"), LogWarn);
        assert_eq!(log_level_string_to_level("fatal"), LogFatal);
    }

    #[test]
    fn module_name_is_file_stem() {
        assert_eq!(filename_to_module_name("src/trace/trace_reader.rs"), "trace_reader");
    }
}
