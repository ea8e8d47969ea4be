#[derive(Debug)]
pub enum CronError {
    Kv(String),
    Dispatch(String),
    Serde(serde_json::Error),
    InvalidCronExpression { expr: String, reason: String },
    InvalidTimezone { tz: String },
    InvalidSchedule { reason: String },
    ScheduleNotFound { id: String },
}

impl std::fmt::Display for CronError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kv(msg) => write!(f, "KV error: {msg}"),
            Self::Dispatch(msg) => write!(f, "Dispatch error: {msg}"),
            Self::Serde(e) => write!(f, "Serialization error: {e}"),
            Self::InvalidCronExpression { expr, reason } => {
                write!(f, "Invalid cron expression '{expr}': {reason}")
            }
            Self::InvalidTimezone { tz } => write!(f, "Invalid timezone '{tz}'"),
            Self::InvalidSchedule { reason } => write!(f, "Invalid schedule: {reason}"),
            Self::ScheduleNotFound { id } => write!(f, "Schedule '{id}' not found"),
        }
    }
}

impl std::error::Error for CronError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CronError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}
