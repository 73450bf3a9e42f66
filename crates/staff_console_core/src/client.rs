use std::{future::Future, pin::Pin};

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::{errors::ApiError, models::SelectedFile, upload::AvatarUploader};

/// REST client for the doctors API.
#[derive(Clone)]
pub struct HttpDoctorClient {
    http_client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpDoctorClient {
    pub fn with_config(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        api_token: Option<String>,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into(),
            api_token,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn upload_doctor_avatar(&self, file: &SelectedFile) -> Result<String> {
        let part = Part::bytes(file.bytes.to_vec())
            .file_name(file.name.clone())
            .mime_str(&file.mime_type)
            .with_context(|| format!("invalid mime type {}", file.mime_type))?;
        let form = Form::new().part("avatar", part);

        let mut request = self
            .http_client
            .post(self.endpoint("doctors/avatar"))
            .multipart(form);
        if let Some(token) = &self.api_token {
            request = request.header("authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .context("failed to call doctors avatar API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: server_message(&body)
                    .unwrap_or_else(|| format!("avatar upload failed with status {status}")),
            }
            .into());
        }

        let value: Value = response
            .json()
            .await
            .context("failed to parse avatar upload response")?;

        avatar_url(&value).ok_or_else(|| ApiError::MissingUrl.into())
    }
}

impl AvatarUploader for HttpDoctorClient {
    fn upload<'a>(
        &'a self,
        file: &'a SelectedFile,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.upload_doctor_avatar(file))
    }
}

fn avatar_url(value: &Value) -> Option<String> {
    value
        .get("url")
        .or_else(|| value.get("data").and_then(|data| data.get("url")))
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
        .map(str::to_string)
}

fn server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error").and_then(|error| error.get("message")))
        .and_then(Value::as_str)
        .map(str::to_string)
}
