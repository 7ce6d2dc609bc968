//! Boot configuration parsed from the loader handoff.
//!
//! The loader (`bootloader_api`) hands the kernel a `&'static BootInfo` with
//! memory map and framebuffer info but no structured configuration, so
//! tunables are threaded through as a single command-line-style string
//! (`key=value` pairs, space separated) the way the teacher's own init path
//! threads a handful of `println!`-visible constants. Parsing is hand-rolled
//! rather than pulling in a crate like `clap`: the grammar is a few
//! whitespace-separated `key=value` pairs, not worth an external dependency
//! in a `no_std` binary.

/// Kernel-wide tunables resolved at boot.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Number of CPUs to bring up via SMP init. `0` means "use whatever ACPI
    /// reports" (see `cpu::smp`).
    pub max_cpus: u32,
    /// Scheduler tick period in milliseconds.
    pub tick_ms: u32,
    /// Minimum `log` level to emit.
    pub log_level: log::LevelFilter,
    /// Skip SMP bring-up entirely and run boot-CPU-only, for debugging.
    pub smp_disabled: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            max_cpus: 0,
            tick_ms: 10,
            log_level: log::LevelFilter::Info,
            smp_disabled: false,
        }
    }
}

impl BootConfig {
    /// Parse a command-line string of whitespace-separated `key=value`
    /// tokens. Unknown keys and malformed values are ignored -- this is a
    /// best-effort debug knob, not a validated configuration format, so a
    /// typo should not prevent boot.
    pub fn parse(cmdline: &str) -> Self {
        let mut config = Self::default();
        for token in cmdline.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "max_cpus" => {
                    if let Ok(n) = value.parse() {
                        config.max_cpus = n;
                    }
                }
                "tick_ms" => {
                    if let Ok(n) = value.parse() {
                        config.tick_ms = n;
                    }
                }
                "log" => {
                    config.log_level = match value {
                        "error" => log::LevelFilter::Error,
                        "warn" => log::LevelFilter::Warn,
                        "info" => log::LevelFilter::Info,
                        "debug" => log::LevelFilter::Debug,
                        "trace" => log::LevelFilter::Trace,
                        "off" => log::LevelFilter::Off,
                        _ => config.log_level,
                    };
                }
                "nosmp" => {
                    config.smp_disabled = value == "1" || value == "true";
                }
                _ => {}
            }
        }
        config
    }

    /// Resolve the boot configuration from whatever the loader handoff made
    /// available. `bootloader_api`'s `BootInfo` carries no command-line
    /// field today, so until a ramdisk-embedded config lands this always
    /// parses an empty string (i.e. returns defaults); the indirection keeps
    /// every call site already using the right entry point.
    pub fn load() -> Self {
        Self::parse("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let cfg = BootConfig::parse("max_cpus=4 tick_ms=5 log=debug nosmp=1");
        assert_eq!(cfg.max_cpus, 4);
        assert_eq!(cfg.tick_ms, 5);
        assert_eq!(cfg.log_level, log::LevelFilter::Debug);
        assert!(cfg.smp_disabled);
    }

    #[test]
    fn ignores_unknown_and_malformed_tokens() {
        let cfg = BootConfig::parse("bogus foo=bar max_cpus=notanumber");
        assert_eq!(cfg.max_cpus, BootConfig::default().max_cpus);
    }
}
