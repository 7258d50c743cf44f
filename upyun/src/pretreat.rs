//! Asynchronous media processing (audio/video pretreatment) on `p0.api.upyun.com`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::client::ClientContext;
use crate::sign::Operator;
use crate::transport::{self, form, HttpRequest, Method};
use crate::{UpyunError, UpyunResult};

/// Most task ids one status query may carry
pub const MAX_STATUS_IDS: usize = 20;

#[derive(Deserialize)]
struct StatusReply {
    tasks: Option<Map<String, Value>>,
}

/// Pretreatment API bound to an operator
#[derive(Clone)]
pub struct Pretreatment {
    ctx: Arc<ClientContext>,
    operator: Operator,
}

impl Pretreatment {
    pub(crate) fn new(ctx: Arc<ClientContext>) -> UpyunResult<Self> {
        let operator = ctx.operator()?.clone();
        Ok(Self { ctx, operator })
    }

    /// Queue `tasks` against the stored file `source`; returns one task id per task.
    ///
    /// `app_name` selects the processing application and is signed with the
    /// other fields when given.
    pub async fn submit(
        &self,
        tasks: &[Value],
        source: &str,
        notify_url: Option<&str>,
        app_name: Option<&str>,
    ) -> UpyunResult<Vec<String>> {
        if tasks.is_empty() {
            return Err(UpyunError::client("no pretreatment tasks given"));
        }
        let mut fields = Map::new();
        fields.insert("bucket_name".into(), json!(self.ctx.bucket));
        fields.insert("source".into(), json!(source));
        fields.insert("notify_url".into(), json!(notify_url.unwrap_or_default()));
        if let Some(app_name) = app_name {
            fields.insert("app_name".into(), json!(app_name));
        }
        fields.insert(
            "tasks".into(),
            json!(STANDARD.encode(serde_json::to_vec(tasks)?)),
        );

        let authorization = self.operator.pretreat_authorization(&fields)?;
        let pairs = string_pairs(&fields);
        let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let request = HttpRequest::new(Method::Post, self.ctx.config.hosts.pretreatment.clone(), "/pretreatment/")
            .header("Authorization", authorization)
            .form(&borrowed);

        let ids: Vec<String> = transport::execute(self.ctx.transport.as_ref(), request)
            .await?
            .json()
            .await?;
        tracing::debug!(count = ids.len(), "pretreatment tasks queued");
        Ok(ids)
    }

    /// Progress of up to [`MAX_STATUS_IDS`] tasks, keyed by task id
    pub async fn status<S: AsRef<str> + Sync>(&self, task_ids: &[S]) -> UpyunResult<Map<String, Value>> {
        if task_ids.is_empty() {
            return Err(UpyunError::client("no task ids given"));
        }
        if task_ids.len() > MAX_STATUS_IDS {
            return Err(UpyunError::client(format!(
                "at most {MAX_STATUS_IDS} task ids per query, got {}",
                task_ids.len()
            )));
        }
        let joined = task_ids
            .iter()
            .map(|id| id.as_ref())
            .collect::<Vec<_>>()
            .join(",");

        let mut fields = Map::new();
        fields.insert("bucket_name".into(), json!(self.ctx.bucket));
        fields.insert("task_ids".into(), json!(joined));

        let authorization = self.operator.pretreat_authorization(&fields)?;
        let query = form::urlencoded(&[
            ("bucket_name", self.ctx.bucket.as_str()),
            ("task_ids", joined.as_str()),
        ]);
        let request = HttpRequest::new(
            Method::Get,
            self.ctx.config.hosts.pretreatment.clone(),
            format!("/status/?{query}"),
        )
        .header("Authorization", authorization);

        let response = transport::execute(self.ctx.transport.as_ref(), request).await?;
        let status = response.status;
        let request_id = response.request_id();
        let reply: StatusReply = response.json().await?;
        reply.tasks.ok_or_else(|| {
            UpyunError::service(request_id, status, "status reply has no tasks", String::new())
        })
    }

    /// Check the signature of a callback UPYUN posted to `notify_url`
    pub fn verify_callback(&self, callback: &Map<String, Value>) -> bool {
        let valid = self.operator.verify_callback(callback);
        if !valid {
            tracing::warn!(task_id = ?callback.get("task_id"), "callback signature mismatch");
        }
        valid
    }
}

fn string_pairs(fields: &Map<String, Value>) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), text)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Upyun;
    use tracing_test::traced_test;

    fn pretreatment() -> Pretreatment {
        Upyun::builder("demo")
            .operator("operator", "password")
            .build()
            .unwrap()
            .pretreatment()
            .unwrap()
    }

    #[test]
    #[traced_test]
    fn forged_callback_is_logged() {
        let mut callback = Map::new();
        callback.insert("task_id".into(), json!("task-1"));
        callback.insert("signature".into(), json!("00000000000000000000000000000000"));

        assert!(!pretreatment().verify_callback(&callback));
        assert!(logs_contain("callback signature mismatch"));
    }

    #[test]
    fn callback_without_signature_fails() {
        let mut callback = Map::new();
        callback.insert("task_id".into(), json!("task-1"));
        assert!(!pretreatment().verify_callback(&callback));
    }

    #[test]
    fn string_pairs_render_scalars() {
        let mut fields = Map::new();
        fields.insert("a".into(), json!("x"));
        fields.insert("b".into(), json!(3));
        assert_eq!(
            string_pairs(&fields),
            vec![("a".to_string(), "x".to_string()), ("b".to_string(), "3".to_string())]
        );
    }
}
