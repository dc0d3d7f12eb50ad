use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::warn;

use super::telemetry::Answer;

/// A structured event forwarded by the host environment (the browser-side
/// capture layer). This is the whole surface the engine sees; no DOM
/// objects cross this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEvent {
    /// A new document finished loading in the active tab.
    PageLoaded { url: String },
    Click,
    Scroll,
    MouseMove,
    KeyDown { key: String },
    VisibilityChanged { hidden: bool },
    BeforeUnload,
    /// The active tab changed.
    TabSwitched,
    /// A navigation committed in the active tab.
    NavigationCompleted {
        url: String,
        #[serde(default)]
        title: String,
    },
    /// The browser window lost focus.
    FocusLost,
    /// The user answered a challenge question.
    QuestionAnswered { answer: Answer, domain: String },
}

/// The page-level subset routed to the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    Loaded { url: String },
    Click,
    Scroll,
    MouseMove,
    KeyDown { key: String },
    VisibilityChanged { hidden: bool },
    BeforeUnload,
}

/// Produces host events. The shipped implementation reads the native
/// messaging pipe; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or None once the host has gone away.
    async fn next_event(&mut self) -> Result<Option<HostEvent>>;
}

/// Reads newline-delimited JSON events from stdin, the way a browser
/// native-messaging host delivers them.
pub struct StdinEventSource {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinEventSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinEventSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSource for StdinEventSource {
    async fn next_event(&mut self) -> Result<Option<HostEvent>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HostEvent>(&line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    // A malformed line never takes the pipe down.
                    warn!("Ignoring malformed host event {line:?}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HostEvent;

    #[test]
    fn host_events_parse_from_tagged_json() {
        let event: HostEvent =
            serde_json::from_str(r#"{"type":"keyDown","key":"a"}"#).unwrap();
        assert_eq!(event, HostEvent::KeyDown { key: "a".into() });

        let event: HostEvent =
            serde_json::from_str(r#"{"type":"pageLoaded","url":"https://x.com"}"#).unwrap();
        assert_eq!(
            event,
            HostEvent::PageLoaded {
                url: "https://x.com".into()
            }
        );

        let event: HostEvent = serde_json::from_str(
            r#"{"type":"navigationCompleted","url":"https://x.com/a"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            HostEvent::NavigationCompleted {
                url: "https://x.com/a".into(),
                title: String::new()
            }
        );
    }
}
