// SPDX-License-Identifier: MPL-2.0

//! Domain-wide tunables.
//!
//! The tunables are taken from the `dvma` module arguments of the kernel
//! command line, e.g. `dvma.strict_flush dvma.fast_range_pages=4
//! dvma.log_level=debug`.

use log::{LevelFilter, warn};

/// The module name that prefixes DVMA command-line arguments.
const MODULE_NAME: &str = "dvma";

/// Tunables of a [`Domain`].
///
/// [`Domain`]: crate::Domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DvmaConfig {
    /// Invalidates the IOTLB synchronously on every mapping change for all
    /// handles of the domain.
    pub strict_flush: bool,
    /// Enables the per-handle preallocated fast path.
    pub fast_path: bool,
    /// The number of pages preallocated for each fast-path range.
    pub fast_range_pages: usize,
    /// Validates device attributes when handles are allocated.
    pub check_attrs: bool,
    /// The log level requested for the DVMA engine.
    pub log_level: Option<LevelFilter>,
}

impl Default for DvmaConfig {
    fn default() -> Self {
        Self {
            strict_flush: false,
            fast_path: true,
            fast_range_pages: 1,
            check_attrs: true,
            log_level: None,
        }
    }
}

impl DvmaConfig {
    /// Builds the tunables from a kernel command line.
    ///
    /// Arguments of other modules are skipped. Unknown keys and malformed
    /// values are reported and ignored.
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut config = Self::default();
        for arg in cmdline.split_whitespace() {
            let Some((module, option)) = arg.split_once('.') else {
                continue;
            };
            if module != MODULE_NAME {
                continue;
            }
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (option, None),
            };
            config.apply(key, value);
        }
        config
    }

    fn apply(&mut self, key: &str, value: Option<&str>) {
        match key {
            "strict_flush" => apply_flag(&mut self.strict_flush, key, value),
            "fast_path" => apply_flag(&mut self.fast_path, key, value),
            "check_attrs" => apply_flag(&mut self.check_attrs, key, value),
            "fast_range_pages" => match value.and_then(|v| v.parse::<usize>().ok()) {
                Some(pages) if pages > 0 => self.fast_range_pages = pages,
                _ => warn!("dvma: invalid value {:?} for `fast_range_pages`", value),
            },
            "log_level" => self.log_level = Some(parse_log_level(value.unwrap_or("off"))),
            _ => warn!("dvma: unknown module argument `{}`", key),
        }
    }

    /// Raises the global log level to the one requested, if any.
    ///
    /// The level is never lowered, so other subsystems keep their output.
    pub fn apply_log_level(&self) {
        let Some(level) = self.log_level else {
            return;
        };
        if level > log::max_level() {
            log::set_max_level(level);
        }
    }
}

fn apply_flag(flag: &mut bool, key: &str, value: Option<&str>) {
    match value {
        None | Some("1" | "on" | "true" | "yes") => *flag = true,
        Some("0" | "off" | "false" | "no") => *flag = false,
        Some(other) => warn!("dvma: invalid value `{}` for `{}`", other, key),
    }
}

fn parse_log_level(value: &str) -> LevelFilter {
    match value {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        // Otherwise, OFF
        _ => LevelFilter::Off,
    }
}
