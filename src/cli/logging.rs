//! Console output levels
//!
//! Library code reports through results and errors; printing happens only on
//! CLI paths, gated by the level the global `--quiet`/`--verbose` flags pick.

/// How much the CLI prints.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Errors only (stderr).
    Quiet,
    /// Progress and result summaries.
    Normal,
    /// Additionally, per-experiment detail such as resumed stages.
    Verbose,
}

impl LogLevel {
    /// Map the global CLI flags to a level. Quiet wins over verbose.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            LogLevel::Quiet
        } else if verbose {
            LogLevel::Verbose
        } else {
            LogLevel::Normal
        }
    }

    fn permits(self, required: LogLevel) -> bool {
        match self {
            LogLevel::Quiet => false,
            LogLevel::Normal => required == LogLevel::Normal,
            LogLevel::Verbose => true,
        }
    }
}

/// Print `msg` when the active `level` covers the message's `required` level.
pub fn log(level: LogLevel, required: LogLevel, msg: &str) {
    if level.permits(required) {
        println!("{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_wins_over_verbose() {
        assert!(LogLevel::from_flags(true, true) == LogLevel::Quiet);
        assert!(LogLevel::from_flags(true, false) == LogLevel::Verbose);
        assert!(LogLevel::from_flags(false, false) == LogLevel::Normal);
    }

    #[test]
    fn test_permits_matrix() {
        assert!(!LogLevel::Quiet.permits(LogLevel::Normal));
        assert!(!LogLevel::Quiet.permits(LogLevel::Verbose));
        assert!(LogLevel::Normal.permits(LogLevel::Normal));
        assert!(!LogLevel::Normal.permits(LogLevel::Verbose));
        assert!(LogLevel::Verbose.permits(LogLevel::Normal));
        assert!(LogLevel::Verbose.permits(LogLevel::Verbose));
    }
}
