use crate::protocol::{LogLevel, StatusMessage};
use slog::{b, record_static, Key, Record, Serializer, KV};
use std::collections::HashMap;

/// The free-form fields of an application's log record, emitted in
/// key order.
struct Fields<'a>(&'a HashMap<String, String>);

impl<'a> KV for Fields<'a> {
    fn serialize(&self, _record: &Record, serializer: &mut dyn Serializer) -> slog::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        for key in keys {
            serializer.emit_str(Key::from(key.clone()), &self.0[key])?;
        }
        Ok(())
    }
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
        }
    }
}

/// Re-emits an application's `log` message on the global logger.
/// Every other message is handed back untouched.
pub(crate) fn translate_message(msg: StatusMessage) -> Option<StatusMessage> {
    match msg {
        StatusMessage::Log { level, msg, kv } => {
            let rs = record_static!(level.into(), "application");
            let fields = Fields(&kv);
            slog_scope::logger().log(&Record::new(&rs, &format_args!("{}", msg), b!(fields)));
            None
        }
        other => Some(other),
    }
}
