//! Template connectors
//!
//! A connector is a TCP endpoint fed with one rendered template per fit or
//! state event. The hub builds the variable dictionary; turning a template
//! into text is the job of a pluggable [`TemplateRenderer`].

use std::sync::Arc;

use fitbridge_core::{Device, DeviceState, Sample, Session, User};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// One connector as sent in `/serve_connectors`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub template: String,
}

impl ConnectorConfig {
    /// Parse the JSON list carried by `/serve_connectors`
    pub fn parse_list(json: &str) -> Result<Vec<ConnectorConfig>> {
        serde_json::from_str(json)
            .map_err(|e| ServiceError::Connector(format!("bad connector list: {e}")))
    }
}

// ----------------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------------

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, vars: &Map<String, Value>) -> Result<String>;
}

/// Substitutes `$name`, `${name}` and dotted paths such as `${sample.pulse}`
///
/// Unknown references are left in place and `$$` yields a literal `$`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    fn lookup<'v>(vars: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
        let mut parts = path.split('.');
        let mut value = vars.get(parts.next()?)?;
        for part in parts {
            value = value.as_object()?.get(part)?;
        }
        Some(value)
    }

    fn text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, vars: &Map<String, Value>) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            if let Some(tail) = after.strip_prefix('$') {
                out.push('$');
                rest = tail;
                continue;
            }

            let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
                match braced.find('}') {
                    Some(end) => (&braced[..end], end + 2),
                    None => ("", 0),
                }
            } else {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                    .unwrap_or(after.len());
                let name = after[..end].trim_end_matches('.');
                (name, name.len())
            };

            match Self::lookup(vars, name).filter(|_| !name.is_empty()) {
                Some(value) => out.push_str(&Self::text(value)),
                None => {
                    out.push('$');
                    out.push_str(&after[..consumed]);
                }
            }
            rest = &after[consumed..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Variable dictionary handed to every connector template
pub fn variables(
    device: &Device,
    state: DeviceState,
    sample: Option<&Sample>,
    session: Option<&Session>,
    user: Option<&User>,
) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("device".into(), to_value(device));
    vars.insert("alias".into(), Value::from(device.alias.clone()));
    vars.insert("state".into(), Value::from(state.name()));
    vars.insert("state_code".into(), Value::from(state.code()));
    let fields = sample.and_then(|s| s.fields().ok()).map(Value::Object);
    vars.insert("sample".into(), fields.unwrap_or(Value::Null));
    vars.insert("session".into(), session.map(to_value).unwrap_or(Value::Null));
    vars.insert("user".into(), user.map(to_value).unwrap_or(Value::Null));
    vars
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ----------------------------------------------------------------------------
// Hub
// ----------------------------------------------------------------------------

struct Connector {
    config: ConnectorConfig,
    lines: mpsc::UnboundedSender<String>,
    writer: JoinHandle<()>,
}

pub struct ConnectorHub {
    renderer: Arc<dyn TemplateRenderer>,
    connectors: Vec<Connector>,
}

impl Default for ConnectorHub {
    fn default() -> Self {
        Self::new(Arc::new(PlaceholderRenderer))
    }
}

impl ConnectorHub {
    pub fn new(renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self {
            renderer,
            connectors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.connectors.iter().map(|c| c.config.name.as_str()).collect()
    }

    /// Replace every connector with `configs`
    pub fn serve(&mut self, configs: Vec<ConnectorConfig>) {
        self.close();
        for config in configs {
            let (lines, rx) = mpsc::unbounded_channel();
            let writer = tokio::spawn(write_lines(config.clone(), rx));
            info!("Connector {} -> {}:{}", config.name, config.host, config.port);
            self.connectors.push(Connector {
                config,
                lines,
                writer,
            });
        }
    }

    /// Render and queue one event for every connector
    pub fn publish(&self, vars: &Map<String, Value>) {
        for connector in &self.connectors {
            match self.renderer.render(&connector.config.template, vars) {
                Ok(text) => {
                    let _ = connector.lines.send(text);
                }
                Err(e) => warn!("Connector {}: {}", connector.config.name, e),
            }
        }
    }

    pub fn close(&mut self) {
        for connector in self.connectors.drain(..) {
            connector.writer.abort();
        }
    }
}

impl Drop for ConnectorHub {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writer task; connects lazily and reconnects after a failed write
async fn write_lines(config: ConnectorConfig, mut lines: mpsc::UnboundedReceiver<String>) {
    let target = format!("{}:{}", config.host, config.port);
    let mut stream: Option<TcpStream> = None;
    while let Some(text) = lines.recv().await {
        if stream.is_none() {
            match TcpStream::connect(&target).await {
                Ok(s) => {
                    debug!("Connector {} connected to {}", config.name, target);
                    stream = Some(s);
                }
                Err(e) => {
                    warn!("Connector {} cannot reach {}: {}", config.name, target, e);
                    continue;
                }
            }
        }
        if let Some(s) = stream.as_mut() {
            if let Err(e) = s.write_all(text.as_bytes()).await {
                warn!("Connector {} write failed: {}", config.name, e);
                stream = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitbridge_core::HrDeviceOutput;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn vars() -> Map<String, Value> {
        let device = Device::new("hrdevice", "AA:BB").with_alias("belt");
        let sample = Sample::Hr(HrDeviceOutput::new(72, 1, -1));
        variables(&device, DeviceState::Online, Some(&sample), None, None)
    }

    #[test]
    fn test_placeholders() {
        let r = PlaceholderRenderer;
        let out = r
            .render("$alias ${sample.pulse} bpm ($state) $$5 $missing ${user.name}", &vars())
            .unwrap();
        assert_eq!(out, "belt 72 bpm (ONLINE) $5 $missing ${user.name}");
    }

    #[test]
    fn test_unterminated_brace_is_literal() {
        let out = PlaceholderRenderer.render("x ${alias", &vars()).unwrap();
        assert_eq!(out, "x ${alias");
    }

    #[test]
    fn test_dictionary_shape() {
        let v = vars();
        assert_eq!(v["alias"], json!("belt"));
        assert_eq!(v["device"]["type"], json!("hrdevice"));
        assert_eq!(v["sample"]["pulse"], json!(72));
        assert_eq!(v["session"], Value::Null);
    }

    #[test]
    fn test_parse_connector_list() {
        let list = ConnectorConfig::parse_list(
            r#"[{"name":"obs","host":"127.0.0.1","port":4000,"template":"$alias"}]"#,
        )
        .unwrap();
        assert_eq!(list[0].port, 4000);
        assert!(ConnectorConfig::parse_list("{").is_err());
    }

    #[tokio::test]
    async fn test_rendered_text_reaches_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut hub = ConnectorHub::default();
        hub.serve(vec![ConnectorConfig {
            name: "overlay".into(),
            host: "127.0.0.1".into(),
            port,
            template: "$alias=${sample.pulse}\n".into(),
        }]);
        assert_eq!(hub.names(), vec!["overlay"]);

        hub.publish(&vars());
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"belt=72\n");
    }
}
