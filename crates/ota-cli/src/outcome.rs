use ota_core::{ErrorKind, UpdatesError};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

impl CommandStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UserError => 1,
            Self::Failure => 2,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    /// Map a core error onto the exit status users see.
    ///
    /// Configuration mistakes are the caller's to fix; everything else is a
    /// failure of the update machinery.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let kind = UpdatesError::classify(err);
        let code = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<UpdatesError>())
            .map(UpdatesError::code);
        let status = if kind == ErrorKind::Configuration {
            CommandStatus::UserError
        } else {
            CommandStatus::Failure
        };
        Self {
            status,
            message: format!("{err:#}"),
            details: json!({
                "kind": kind.as_ref(),
                "code": code,
            }),
        }
    }

    pub fn to_json(&self, command: &str) -> Value {
        json!({
            "command": command,
            "status": self.status,
            "message": self.message,
            "details": self.details,
        })
    }
}
