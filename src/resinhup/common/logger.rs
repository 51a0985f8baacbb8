use chrono::Local;
use colored::Colorize;
use failure::ResultExt;
use log::{Level, Log, Metadata, Record};
use regex::Regex;

use crate::common::{UpdErrCtx, UpdError, UpdErrorKind};

pub const DEFAULT_LOG_LEVEL: Level = Level::Info;

#[derive(Debug)]
pub struct Logger {
    default_level: Level,
    color: bool,
    module_re: Regex,
}

impl Logger {
    pub fn initialise(debug: bool, color: bool) -> Result<(), UpdError> {
        let logger = Logger {
            default_level: if debug { Level::Debug } else { DEFAULT_LOG_LEVEL },
            color,
            module_re: Regex::new(r#"^[^:]+::(.*)$"#).unwrap(),
        };

        let max_level = logger.default_level;

        log::set_boxed_logger(Box::new(logger)).context(UpdErrCtx::from_remark(
            UpdErrorKind::Upstream,
            "initialise: failed to initialize logger",
        ))?;
        log::set_max_level(max_level.to_level_filter());

        Ok(())
    }
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut mod_name = String::from("undefined");
        if let Some(mod_path) = record.module_path() {
            if let Some(ref captures) = self.module_re.captures(mod_path) {
                mod_name = String::from(captures.get(1).unwrap().as_str());
            }
        }

        let curr_level = record.metadata().level();
        if curr_level <= self.default_level {
            let output = format!(
                "{} {:<5} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level().to_string(),
                &mod_name,
                record.args()
            );

            if self.color {
                match curr_level {
                    Level::Error => println!("{}", output.red()),
                    Level::Warn => println!("{}", output.yellow()),
                    Level::Info => println!("{}", output.green()),
                    Level::Debug => println!("{}", output.cyan()),
                    Level::Trace => println!("{}", output.blue()),
                };
            } else {
                println!("{}", output);
            }
        }
    }

    fn flush(&self) {}
}
