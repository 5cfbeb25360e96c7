/// Per-VM configuration.
///
/// Everything the core needs from its host arrives through this record:
/// output, input, error reporting, module resolution and GC tuning. Every
/// callback has a sensible default wired to the process stdio and the file
/// system, so `PkConfiguration::default()` gives a batteries-included VM and
/// embedders replace only what they need.

use std::path::{Path, PathBuf};

use colored::Colorize;

use crate::errors::ErrorKind;

pub type WriteFn = Box<dyn FnMut(&str)>;
pub type ReadFn = Box<dyn FnMut() -> String>;
pub type ErrorFn = Box<dyn FnMut(ErrorKind, &str, u32, &str)>;
/// `(importing module path, import name) -> canonical path`.
pub type ResolvePathFn = Box<dyn Fn(&str, &str) -> Option<String>>;
/// `canonical path -> source text`.
pub type LoadScriptFn = Box<dyn Fn(&str) -> Option<String>>;

pub struct PkConfiguration {
    pub write_fn: WriteFn,
    pub read_fn: ReadFn,
    pub error_fn: ErrorFn,
    pub resolve_path_fn: ResolvePathFn,
    pub load_script_fn: LoadScriptFn,
    /// Lone top-level expressions echo their value; unexpected EOF becomes a
    /// soft error so the driver can append lines.
    pub repl_mode: bool,
    /// Enables GC event logging and disables the implicit tail-call rewrite
    /// at function-body ends (keeps frames visible in stacktraces).
    pub debug: bool,
    pub heap_grow_percent: usize,
    pub min_heap_size: usize,
}

impl Default for PkConfiguration {
    fn default() -> Self {
        PkConfiguration {
            write_fn: Box::new(|text| {
                use std::io::Write;
                let mut out = std::io::stdout();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }),
            read_fn: Box::new(|| {
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
                line.trim_end_matches(['\r', '\n']).to_string()
            }),
            error_fn: Box::new(|kind, file, line, msg| match kind {
                ErrorKind::Compile => {
                    eprintln!("{} {}:{}: {}", "compile error:".red().bold(), file, line, msg)
                }
                ErrorKind::Runtime => {
                    eprintln!("{} {}", "runtime error:".red().bold(), msg)
                }
                ErrorKind::Stacktrace => {
                    eprintln!("  {} {}:{}: {}", "at".dimmed(), file, line, msg)
                }
            }),
            resolve_path_fn: Box::new(default_resolve_path),
            load_script_fn: Box::new(|path| std::fs::read_to_string(path).ok()),
            repl_mode: false,
            debug: false,
            heap_grow_percent: 150,
            min_heap_size: 1024 * 1024,
        }
    }
}

/// Resolve an import name relative to the importing module's directory,
/// trying the name verbatim and with the `.pk` extension.
fn default_resolve_path(from: &str, name: &str) -> Option<String> {
    let base: PathBuf = Path::new(from)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    for candidate in [name.to_string(), format!("{}.pk", name)] {
        let joined = if base.as_os_str().is_empty() {
            PathBuf::from(&candidate)
        } else {
            base.join(&candidate)
        };
        if joined.is_file() {
            return Some(joined.to_string_lossy().into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let conf = PkConfiguration::default();
        assert!(!conf.repl_mode);
        assert!(!conf.debug);
        assert_eq!(conf.heap_grow_percent, 150);
    }

    #[test]
    fn resolve_misses_on_absent_files() {
        assert!(default_resolve_path("main.pk", "no_such_module").is_none());
    }
}
