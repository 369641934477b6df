//! Wire format: one inbound JSON request, tagged text frames outbound.

use crate::error::ExecError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Outbound channel, encoded as the first character of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
    Timing,
}

impl Channel {
    pub fn tag(self) -> char {
        match self {
            Channel::Stdout => 'o',
            Channel::Stderr => 'e',
            Channel::Timing => 't',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'o' => Some(Channel::Stdout),
            'e' => Some(Channel::Stderr),
            't' => Some(Channel::Timing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub channel: Channel,
    pub payload: String,
}

impl OutputFrame {
    pub fn stdout(payload: impl Into<String>) -> Self {
        Self {
            channel: Channel::Stdout,
            payload: payload.into(),
        }
    }

    pub fn stderr(payload: impl Into<String>) -> Self {
        Self {
            channel: Channel::Stderr,
            payload: payload.into(),
        }
    }

    /// Run-phase elapsed time, milliseconds with two decimals.
    pub fn timing(elapsed: Duration) -> Self {
        Self {
            channel: Channel::Timing,
            payload: format!("{:.2}ms", elapsed.as_secs_f64() * 1000.0),
        }
    }

    pub fn error(err: &ExecError) -> Self {
        Self::stderr(err.to_string())
    }

    pub fn encode(&self) -> String {
        let mut message = String::with_capacity(self.payload.len() + 1);
        message.push(self.channel.tag());
        message.push_str(&self.payload);
        message
    }

    pub fn decode(message: &str) -> Option<Self> {
        let mut chars = message.chars();
        let channel = Channel::from_tag(chars.next()?)?;
        Some(Self {
            channel,
            payload: chars.as_str().to_string(),
        })
    }
}

/// Ordered outbound frame queue for one session.
///
/// Every frame is handed to the connection as soon as it is produced.
/// Stderr payloads are also kept so the session can log them at the end.
#[derive(Debug)]
pub struct FrameSink {
    tx: mpsc::Sender<OutputFrame>,
    errors: String,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<OutputFrame>) -> Self {
        Self {
            tx,
            errors: String::new(),
        }
    }

    pub async fn send(&mut self, frame: OutputFrame) -> Result<(), ExecError> {
        if frame.channel == Channel::Stderr {
            self.errors.push_str(&frame.payload);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| ExecError::Disconnected)
    }

    /// Everything sent on the stderr channel so far.
    pub fn errors(&self) -> &str {
        &self.errors
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    language: Option<String>,
    code: Option<String>,
    uuid: Option<String>,
    custom_dir: Option<String>,
    run_args: Option<String>,
    comp_args: Option<String>,
}

/// A validated execution request. One per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    pub token: String,
    pub custom_dir: Option<PathBuf>,
    pub compile_args: Vec<String>,
    pub run_args: Vec<String>,
}

impl ExecutionRequest {
    pub fn parse(message: &str) -> Result<Self, ExecError> {
        let raw: RawRequest = serde_json::from_str(message)
            .map_err(|e| ExecError::InvalidRequest(e.to_string()))?;

        let token = non_empty(raw.uuid).ok_or(ExecError::MissingToken)?;
        let (Some(language), Some(code)) = (non_empty(raw.language), non_empty(raw.code)) else {
            return Err(ExecError::MissingCodeOrLanguage);
        };

        Ok(Self {
            language,
            code,
            token,
            custom_dir: non_empty(raw.custom_dir).map(PathBuf::from),
            compile_args: split_args(raw.comp_args.as_deref()),
            run_args: split_args(raw.run_args.as_deref()),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Whitespace split, never shell-interpreted.
fn split_args(args: Option<&str>) -> Vec<String> {
    args.map(|a| a.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tag_plus_payload() {
        assert_eq!(OutputFrame::stdout("hi\n").encode(), "ohi\n");
        assert_eq!(OutputFrame::stderr("boom").encode(), "eboom");
        assert_eq!(
            OutputFrame::timing(Duration::from_micros(12_500)).encode(),
            "t12.50ms"
        );
    }

    #[test]
    fn decode_splits_tag() {
        let frame = OutputFrame::decode("t1.00ms").unwrap();
        assert_eq!(frame.channel, Channel::Timing);
        assert_eq!(frame.payload, "1.00ms");
        assert!(OutputFrame::decode("xnope").is_none());
        assert!(OutputFrame::decode("").is_none());
    }

    #[test]
    fn parses_full_request() {
        let request = ExecutionRequest::parse(
            r#"{"language":"c","code":"int main(){}","uuid":"abc",
                "customDir":"/work","compArgs":"-O2  -Wall","runArgs":" 1 2 "}"#,
        )
        .unwrap();
        assert_eq!(request.language, "c");
        assert_eq!(request.token, "abc");
        assert_eq!(request.custom_dir, Some(PathBuf::from("/work")));
        assert_eq!(request.compile_args, vec!["-O2", "-Wall"]);
        assert_eq!(request.run_args, vec!["1", "2"]);
    }

    #[test]
    fn shell_metacharacters_stay_literal() {
        let request = ExecutionRequest::parse(
            r#"{"language":"bash","code":"echo","uuid":"u","runArgs":"$(rm -rf) ;ls"}"#,
        )
        .unwrap();
        assert_eq!(request.run_args, vec!["$(rm", "-rf)", ";ls"]);
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = ExecutionRequest::parse(r#"{"language":"python","code":"x"}"#).unwrap_err();
        assert!(matches!(err, ExecError::MissingToken));

        let err = ExecutionRequest::parse(r#"{"code":"x","uuid":"u"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Error: Missing code or language");

        let err = ExecutionRequest::parse(r#"{"language":"python","code":"","uuid":"u"}"#)
            .unwrap_err();
        assert!(matches!(err, ExecError::MissingCodeOrLanguage));
    }

    #[tokio::test]
    async fn sink_keeps_order_and_accumulates_stderr() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut sink = FrameSink::new(tx);
        sink.send(OutputFrame::stdout("a")).await.unwrap();
        sink.send(OutputFrame::stderr("warn ")).await.unwrap();
        sink.send(OutputFrame::stderr("again")).await.unwrap();
        assert_eq!(sink.errors(), "warn again");
        assert_eq!(rx.recv().await.unwrap().encode(), "oa");
        assert_eq!(rx.recv().await.unwrap().encode(), "ewarn ");
        assert_eq!(rx.recv().await.unwrap().encode(), "eagain");

        drop(rx);
        let err = sink.send(OutputFrame::stdout("late")).await.unwrap_err();
        assert!(matches!(err, ExecError::Disconnected));
    }

    #[test]
    fn malformed_json_is_invalid_request() {
        let err = ExecutionRequest::parse("{not json").unwrap_err();
        assert!(matches!(err, ExecError::InvalidRequest(_)));
        assert!(err.to_string().starts_with("Error: Invalid request:"));

        let err = ExecutionRequest::parse(r#"{"language":5,"code":"x","uuid":"u"}"#).unwrap_err();
        assert!(matches!(err, ExecError::InvalidRequest(_)));
    }
}
