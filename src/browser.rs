use crate::errors::{AppError, AppResult};
use serde_json::{json, Value};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Thin W3C WebDriver client. Plain request/response plumbing over a running
/// driver (chromedriver, geckodriver); no retry or wait logic lives here.
pub struct BrowserClient {
    http: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
}

impl BrowserClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: None,
        }
    }

    pub async fn open(&mut self) -> AppResult<()> {
        let body = json!({ "capabilities": { "alwaysMatch": {} } });
        let value = self
            .send(reqwest::Method::POST, &format!("{}/session", self.base_url), Some(body))
            .await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Browser("driver returned no session id".to_string()))?;
        self.session_id = Some(session_id);
        Ok(())
    }

    pub async fn close(&mut self) -> AppResult<()> {
        if let Some(session_id) = self.session_id.take() {
            let url = format!("{}/session/{}", self.base_url, session_id);
            let _ = self.send(reqwest::Method::DELETE, &url, None).await?;
        }
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> AppResult<()> {
        let endpoint = self.session_url("url")?;
        let _ = self
            .send(reqwest::Method::POST, &endpoint, Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    pub async fn title(&self) -> AppResult<String> {
        let endpoint = self.session_url("title")?;
        let value = self.send(reqwest::Method::GET, &endpoint, None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn click(&self, selector: &str) -> AppResult<()> {
        let element = self.find_element(selector).await?;
        let endpoint = self.session_url(&format!("element/{element}/click"))?;
        let _ = self
            .send(reqwest::Method::POST, &endpoint, Some(json!({})))
            .await?;
        Ok(())
    }

    pub async fn type_text(&self, selector: &str, text: &str) -> AppResult<()> {
        let element = self.find_element(selector).await?;
        let endpoint = self.session_url(&format!("element/{element}/value"))?;
        let _ = self
            .send(reqwest::Method::POST, &endpoint, Some(json!({ "text": text })))
            .await?;
        Ok(())
    }

    /// Visible text of the page body.
    pub async fn page_text(&self) -> AppResult<String> {
        let element = self.find_element("body").await?;
        let endpoint = self.session_url(&format!("element/{element}/text"))?;
        let value = self.send(reqwest::Method::GET, &endpoint, None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn find_element(&self, selector: &str) -> AppResult<String> {
        let endpoint = self.session_url("element")?;
        let body = json!({ "using": "css selector", "value": selector });
        let value = self.send(reqwest::Method::POST, &endpoint, Some(body)).await?;
        extract_element_id(&value)
            .ok_or_else(|| AppError::Browser(format!("no element matched selector '{selector}'")))
    }

    fn session_url(&self, suffix: &str) -> AppResult<String> {
        let session_id = self
            .session_id
            .as_ref()
            .ok_or_else(|| AppError::Browser("no open browser session".to_string()))?;
        Ok(format!("{}/session/{}/{}", self.base_url, session_id, suffix))
    }

    /// Issue one request and unwrap the WebDriver `value` envelope, mapping
    /// protocol errors into [`AppError::Browser`].
    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<Value>,
    ) -> AppResult<Value> {
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        if !status.is_success() {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("webdriver request failed");
            return Err(AppError::Browser(format!("{status}: {message}")));
        }
        Ok(value)
    }
}

fn extract_element_id(value: &Value) -> Option<String> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
}
