//! Wire protocol between the pool and its worker processes.
//!
//! Every frame on a worker channel carries one JSON-encoded [`Message`];
//! the zero-length sentinel frame is handled by the framing layer.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies one submitted job (an apply, a map or an imap).
pub type JobId = u64;

/// Result of one task as it travels back to the parent.
pub type Outcome = Result<Value, TaskError>;

/// Positional and keyword arguments of a single call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Decode positional argument `i`.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, i: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(i)
            .ok_or_else(|| anyhow::anyhow!("missing positional argument {}", i))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("argument {} has the wrong type: {}", i, e))
    }

    /// Decode keyword argument `name`, `None` if it was not passed.
    pub fn kwarg<T: serde::de::DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("keyword '{}' has the wrong type: {}", name, e))
            })
            .transpose()
    }
}

/// What a task asks the worker to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// One call of the named function.
    Call(TaskArgs),
    /// A chunk of a map: one call per item, results collected in order.
    Chunk {
        items: Vec<Vec<Value>>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        kwargs: Map<String, Value>,
    },
}

impl Payload {
    /// Number of results this payload produces.
    pub fn result_count(&self) -> usize {
        match self {
            Self::Call(_) => 1,
            Self::Chunk { items, .. } => items.len(),
        }
    }
}

/// One unit of work, consumed by exactly one worker attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub job_id: JobId,
    /// Position within the job (chunk number for maps).
    pub index: usize,
    /// Registered function name.
    pub name: String,
    pub payload: Payload,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            job_id: self.job_id,
            index: self.index,
        }
    }
}

/// `(job, index)` pair identifying one task in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub job_id: JobId,
    pub index: usize,
}

/// Frames exchanged with workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Parent to worker.
    Task(Task),

    /// Worker to parent, sent before the task runs.
    Ack {
        job_id: JobId,
        index: usize,
        accepted_at: DateTime<Utc>,
        pid: i32,
    },

    /// Worker to parent, sent after the task ran.
    Ready {
        job_id: JobId,
        index: usize,
        outcome: Outcome,
    },

    /// Worker to parent, sent just before a clean exit.
    Death { pid: i32, exit_code: i32 },
}

impl Message {
    pub fn ack(key: TaskKey, pid: i32) -> Self {
        Self::Ack {
            job_id: key.job_id,
            index: key.index,
            accepted_at: Utc::now(),
            pid,
        }
    }

    pub fn ready(key: TaskKey, outcome: Outcome) -> Self {
        Self::Ready {
            job_id: key.job_id,
            index: key.index,
            outcome,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Ack { .. } => "ack",
            Self::Ready { .. } => "ready",
            Self::Death { .. } => "death",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_wire_shape() {
        let msg = Message::Task(Task {
            job_id: 7,
            index: 2,
            name: "square".into(),
            payload: Payload::Call(TaskArgs::new(vec![json!(3)])),
        });
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "task");
        assert_eq!(encoded["name"], "square");
        assert_eq!(encoded["payload"]["kind"], "call");
        assert_eq!(encoded["payload"]["args"], json!([3]));
        assert!(encoded["payload"].get("kwargs").is_none());

        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ready_carries_task_error() {
        let msg = Message::ready(
            TaskKey {
                job_id: 1,
                index: 0,
            },
            Err(TaskError::UnknownTask {
                name: "nope".into(),
            }),
        );
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"type\":\"ready\""));
        assert!(text.contains("unknown_task"));
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_chunk_result_count() {
        let payload = Payload::Chunk {
            items: vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]],
            kwargs: Map::new(),
        };
        assert_eq!(payload.result_count(), 3);
        assert_eq!(Payload::Call(TaskArgs::default()).result_count(), 1);
    }

    #[test]
    fn test_task_args_accessors() {
        let mut kwargs = Map::new();
        kwargs.insert("scale".into(), json!(2.5));
        let args = TaskArgs::new(vec![json!(4), json!("x")]).with_kwargs(kwargs);

        assert_eq!(args.arg::<i64>(0).unwrap(), 4);
        assert_eq!(args.arg::<String>(1).unwrap(), "x");
        assert!(args.arg::<i64>(1).is_err());
        assert!(args.arg::<i64>(5).is_err());
        assert_eq!(args.kwarg::<f64>("scale").unwrap(), Some(2.5));
        assert_eq!(args.kwarg::<f64>("missing").unwrap(), None);
    }
}
