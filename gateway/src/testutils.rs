use async_trait::async_trait;
use experiments::{RemoteClient, RemoteConfig, RemoteError, RemoteErrorKind};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;

/// App experiment `dark_mode` with the given default, shared experiment `new_nav` on.
pub fn configured(dark_mode: bool) -> RemoteConfig {
    RemoteConfig {
        app: json!({"experiments": [{"name": "dark_mode", "default": dark_mode}]}),
        shared: json!({"experiments": [{"name": "new_nav", "default": true}]}),
    }
}

pub fn unavailable() -> Result<RemoteConfig, RemoteError> {
    Err(RemoteError {
        kind: RemoteErrorKind::RetriesExceeded,
        defaults: RemoteConfig {
            app: json!({"experiments": []}),
            shared: json!({}),
        },
    })
}

/// Remote client replaying scripted outcomes in call order, recording which
/// operation consumed each one.
pub struct ScriptedRemote {
    outcomes: Mutex<VecDeque<Result<RemoteConfig, RemoteError>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedRemote {
    pub fn new(outcomes: Vec<Result<RemoteConfig, RemoteError>>) -> Self {
        ScriptedRemote {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, op: &'static str) -> Result<RemoteConfig, RemoteError> {
        self.calls.lock().unwrap().push(op);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(unavailable)
    }
}

#[async_trait]
impl RemoteClient for ScriptedRemote {
    fn reference(&self) -> String {
        "test".into()
    }

    async fn load(&self) -> Result<RemoteConfig, RemoteError> {
        self.next("load")
    }

    async fn announce(&self) -> Result<RemoteConfig, RemoteError> {
        self.next("announce")
    }
}
