use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::client::ClientContext;
use crate::sign::{encode_policy, form_signature};
use crate::transport::{self, form::MultipartForm, HttpRequest, Method};
use crate::{UpyunError, UpyunResult};

/// Single-request uploads through the form API.
///
/// The policy names the bucket, an expiration and the `save-key`; extra
/// policy fields (`return-url`, `notify-url`, `content-md5`, ...) pass
/// through untouched.
#[derive(Clone)]
pub struct FormUploader {
    ctx: Arc<ClientContext>,
    secret: String,
}

impl FormUploader {
    pub(crate) fn new(ctx: Arc<ClientContext>) -> UpyunResult<Self> {
        let secret = ctx.form_secret()?.to_string();
        Ok(Self { ctx, secret })
    }

    /// Policy document for `key`, merged with `extra`
    pub fn policy(&self, key: &str, extra: &Map<String, Value>) -> Map<String, Value> {
        let mut fields = extra.clone();
        fields.insert("bucket".into(), json!(self.ctx.bucket));
        fields.insert(
            "expiration".into(),
            json!(Utc::now().timestamp() + self.ctx.config.form_expiration_secs),
        );
        fields.insert(
            "save-key".into(),
            json!(format!("/{}", key.trim_start_matches('/'))),
        );
        fields
    }

    /// Upload `data` to `key`; returns the JSON reply of the form API
    pub async fn upload(
        &self,
        key: &str,
        data: Bytes,
        extra: &Map<String, Value>,
    ) -> UpyunResult<Map<String, Value>> {
        let fields = self.policy(key, extra);
        let policy = encode_policy(&fields)?;
        let signature = form_signature(&policy, &self.secret);
        let filename = key
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .ok_or_else(|| UpyunError::client("form upload needs a file name in the key"))?
            .to_string();

        let request = HttpRequest::new(
            Method::Post,
            self.ctx.config.form_host(),
            format!("/{}/", self.ctx.bucket),
        )
        .multipart(
            MultipartForm::new()
                .text("policy", policy)
                .text("signature", signature)
                .file("file", filename, data),
        );

        transport::execute(self.ctx.transport.as_ref(), request)
            .await?
            .json()
            .await
    }
}
