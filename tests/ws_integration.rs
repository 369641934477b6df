use futures_util::{SinkExt, StreamExt};
use localexec::client::{self, Outcome, SubmitOptions};
use localexec::config::ServerConfig;
use localexec::languages::HandlerRegistry;
use localexec::state::AppState;
use localexec::trust::ApprovalRequest;
use localexec::ws_server;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const TRUSTED: &str = "abc";

struct TestServer {
    address: SocketAddr,
    root: TempDir,
    approvals: mpsc::UnboundedReceiver<ApprovalRequest>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(deadline: Duration) -> Self {
        let root = TempDir::new().expect("temp root should be created");
        let config = ServerConfig {
            port: 0,
            workspace_root: root.path().join("workspaces"),
            deadline,
            trusted_tokens: vec![TRUSTED.to_string()],
            ..ServerConfig::default()
        };
        let (state, approvals) = AppState::new(config, HandlerRegistry::builtin());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("test listener should bind");
        let address = listener
            .local_addr()
            .expect("test listener should expose local address");
        let task = tokio::spawn(async move {
            ws_server::serve(listener, state)
                .await
                .expect("server should serve test traffic");
        });
        Self {
            address,
            root,
            approvals,
            task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/", self.address)
    }

    fn workspace_root(&self) -> PathBuf {
        self.root.path().join("workspaces")
    }

    fn leftover_workspaces(&self) -> usize {
        std::fs::read_dir(self.workspace_root())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    async fn connect(&self) -> ClientSocket {
        let (socket, _) = connect_async(self.url())
            .await
            .expect("test websocket connection should succeed");
        socket
    }

    /// Send one request and collect every text message until the server closes.
    async fn exchange(&self, request: serde_json::Value) -> Vec<String> {
        let mut socket = self.connect().await;
        send_text(&mut socket, request.to_string()).await;
        read_until_close(&mut socket).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_text(socket: &mut ClientSocket, text: String) {
    socket
        .send(WsMessage::Text(text))
        .await
        .expect("request should be sent");
}

async fn read_until_close(socket: &mut ClientSocket) -> Vec<String> {
    timeout(Duration::from_secs(20), async {
        let mut messages = Vec::new();
        while let Some(message) = socket.next().await {
            match message {
                Ok(WsMessage::Text(text)) => messages.push(text),
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        messages
    })
    .await
    .expect("timed out waiting for the server to close")
}

async fn wait_until_empty(server: &TestServer) {
    timeout(Duration::from_secs(5), async {
        while server.leftover_workspaces() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("workspace should be removed");
}

fn has_toolchain(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn trusted_bash_run_streams_output_and_timing() {
    let server = TestServer::start(Duration::from_secs(10)).await;
    let messages = server
        .exchange(json!({ "language": "bash", "code": "echo hi", "uuid": TRUSTED }))
        .await;

    assert_eq!(messages.len(), 2, "got {messages:?}");
    assert_eq!(messages[0], "ohi\n");
    assert!(messages[1].starts_with('t') && messages[1].ends_with("ms"));
    let millis: f64 = messages[1][1..messages[1].len() - 2]
        .parse()
        .expect("timing should be numeric");
    assert!(millis >= 0.0);
    assert_eq!(server.leftover_workspaces(), 0);
}

#[tokio::test]
async fn python_scenario() {
    if !has_toolchain("python3") {
        eprintln!("skipping: python3 not installed");
        return;
    }
    let server = TestServer::start(Duration::from_secs(10)).await;
    let messages = server
        .exchange(json!({ "language": "python", "code": "print('hi')", "uuid": TRUSTED }))
        .await;
    assert_eq!(messages[0], "ohi\n");
    assert_eq!(messages.len(), 2);
    assert!(messages[1].starts_with('t'));
}

#[tokio::test]
async fn c_program_exiting_non_zero_reports_run_failure() {
    if !has_toolchain("gcc") {
        eprintln!("skipping: gcc not installed");
        return;
    }
    let server = TestServer::start(Duration::from_secs(30)).await;
    let messages = server
        .exchange(json!({ "language": "c", "code": "int main(){return 1;}", "uuid": TRUSTED }))
        .await;
    assert_eq!(messages, vec!["eRun failed: Command failed with exit code 1"]);
    assert_eq!(server.leftover_workspaces(), 0);
}

#[tokio::test]
async fn c_compile_error_never_runs_and_hides_workspace_path() {
    if !has_toolchain("gcc") {
        eprintln!("skipping: gcc not installed");
        return;
    }
    let server = TestServer::start(Duration::from_secs(30)).await;
    let messages = server
        .exchange(json!({ "language": "c", "code": "int main( {", "uuid": TRUSTED }))
        .await;

    let last = messages.last().expect("expected an error frame");
    assert!(last.starts_with("eCompilation failed: Command failed with exit code"));
    assert!(messages.iter().all(|m| !m.starts_with('t')));
    let root = server.workspace_root();
    let root = root.to_string_lossy();
    assert!(messages.iter().all(|m| !m.contains(root.as_ref())));
    assert!(messages.iter().any(|m| m.contains("/program.c")));
    assert_eq!(server.leftover_workspaces(), 0);
}

#[tokio::test]
async fn missing_fields_close_without_workspace() {
    let server = TestServer::start(Duration::from_secs(10)).await;

    let messages = server.exchange(json!({ "code": "echo", "uuid": TRUSTED })).await;
    assert_eq!(messages, vec!["eError: Missing code or language"]);

    let messages = server.exchange(json!({ "language": "bash", "code": "echo" })).await;
    assert_eq!(messages, vec!["eError: Missing UUID"]);

    let mut socket = server.connect().await;
    send_text(&mut socket, "{oops".to_string()).await;
    let messages = read_until_close(&mut socket).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("eError: Invalid request:"));

    assert!(!server.workspace_root().exists());
}

#[tokio::test]
async fn unsupported_language_is_reported() {
    let server = TestServer::start(Duration::from_secs(10)).await;
    let messages = server
        .exchange(json!({ "language": "brainfuck", "code": "+", "uuid": TRUSTED }))
        .await;
    assert_eq!(messages, vec!["eError: Unsupported language brainfuck"]);
    assert!(!server.workspace_root().exists());
}

#[tokio::test]
async fn unseen_token_is_held_until_approved_and_remembered() {
    let mut server = TestServer::start(Duration::from_secs(10)).await;

    let mut socket = server.connect().await;
    send_text(
        &mut socket,
        json!({ "language": "bash", "code": "echo first", "uuid": "browser-1" }).to_string(),
    )
    .await;

    let pending = timeout(Duration::from_secs(5), server.approvals.recv())
        .await
        .expect("approval should be requested")
        .expect("approval queue should stay open");
    assert_eq!(pending.token(), "browser-1");

    // While this session waits, a trusted client is still served.
    let other = server
        .exchange(json!({ "language": "bash", "code": "echo other", "uuid": TRUSTED }))
        .await;
    assert_eq!(other[0], "oother\n");

    pending.approve();
    let messages = read_until_close(&mut socket).await;
    assert_eq!(messages[0], "ofirst\n");

    let again = server
        .exchange(json!({ "language": "bash", "code": "echo again", "uuid": "browser-1" }))
        .await;
    assert_eq!(again[0], "oagain\n");
    assert!(server.approvals.try_recv().is_err());
}

#[tokio::test]
async fn rejected_token_gets_rejection_and_no_execution() {
    let mut server = TestServer::start(Duration::from_secs(10)).await;
    let marker = server.root.path().join("ran");

    let mut socket = server.connect().await;
    send_text(
        &mut socket,
        json!({
            "language": "bash",
            "code": format!("touch {}", marker.display()),
            "uuid": "intruder",
        })
        .to_string(),
    )
    .await;

    let pending = timeout(Duration::from_secs(5), server.approvals.recv())
        .await
        .expect("approval should be requested")
        .expect("approval queue should stay open");
    pending.reject();

    let messages = read_until_close(&mut socket).await;
    assert_eq!(messages, vec!["eExecution not confirmed by the user."]);
    assert!(!marker.exists());
    assert!(!server.workspace_root().exists());
}

#[tokio::test]
async fn timeout_kills_run_and_removes_workspace() {
    let server = TestServer::start(Duration::from_secs(1)).await;
    let messages = server
        .exchange(json!({ "language": "bash", "code": "sleep 30", "uuid": TRUSTED }))
        .await;
    assert_eq!(messages, vec!["eExecution timed out after 1s"]);
    wait_until_empty(&server).await;
}

#[tokio::test]
async fn abrupt_disconnect_cleans_up() {
    let server = TestServer::start(Duration::from_secs(30)).await;
    let mut socket = server.connect().await;
    send_text(
        &mut socket,
        json!({ "language": "bash", "code": "echo started\nsleep 30", "uuid": TRUSTED })
            .to_string(),
    )
    .await;

    let first = timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("expected output before disconnect")
        .expect("stream should be open")
        .expect("frame should decode");
    assert_eq!(first, WsMessage::Text("ostarted\n".to_string()));
    assert_eq!(server.leftover_workspaces(), 1);

    drop(socket);
    wait_until_empty(&server).await;
}

#[tokio::test]
async fn custom_dir_is_preserved() {
    let server = TestServer::start(Duration::from_secs(10)).await;
    let custom = TempDir::new().expect("custom dir should be created");
    let messages = server
        .exchange(json!({
            "language": "bash",
            "code": "echo kept > out.txt",
            "uuid": TRUSTED,
            "customDir": custom.path(),
        }))
        .await;

    assert!(messages.last().is_some_and(|m| m.starts_with('t')));
    assert!(custom.path().join("script.sh").exists());
    assert_eq!(
        std::fs::read_to_string(custom.path().join("out.txt")).unwrap(),
        "kept\n"
    );
    assert!(!server.workspace_root().exists());

    let messages = server
        .exchange(json!({
            "language": "bash",
            "code": "echo",
            "uuid": TRUSTED,
            "customDir": missing_dir(custom.path()),
        }))
        .await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("eError: Custom folder"));
}

fn missing_dir(base: &Path) -> PathBuf {
    base.join("does-not-exist")
}

#[tokio::test]
async fn submit_client_renders_frames() {
    let server = TestServer::start(Duration::from_secs(10)).await;
    let options = SubmitOptions {
        url: server.url(),
        language: "bash".to_string(),
        code: "echo out\necho err >&2\necho \"$1\"".to_string(),
        token: TRUSTED.to_string(),
        custom_dir: None,
        run_args: Some("arg1".to_string()),
        comp_args: None,
    };
    let mut out = Vec::new();
    let mut err = Vec::new();
    let outcome = client::submit(&options, &mut out, &mut err)
        .await
        .expect("submit should succeed");

    assert!(matches!(outcome, Outcome::Completed(_)));
    assert_eq!(String::from_utf8(out).unwrap(), "out\narg1\n");
    let err = String::from_utf8(err).unwrap();
    assert!(err.contains("err\n"));
    assert!(err.contains("finished in "));

    let failing = SubmitOptions {
        code: "exit 3".to_string(),
        run_args: None,
        ..options
    };
    let outcome = client::submit(&failing, &mut Vec::new(), &mut Vec::new())
        .await
        .expect("submit should succeed");
    assert_eq!(outcome, Outcome::Failed);
}
