use bytes::Bytes;
use echome_voice::{AsrAdapter, AsrConfig, Recognizer, Transcript, VoiceError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

type ServerSocket = WebSocketStream<TcpStream>;

/// Serves exactly one upstream connection with `script`.
async fn spawn_upstream<F, Fut>(script: F) -> String
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await;
    });
    format!("ws://{}/api-ws/v1/inference", addr)
}

fn config(url: String) -> AsrConfig {
    AsrConfig {
        url,
        connect_timeout_secs: 2,
        write_timeout_secs: 2,
        idle_timeout_secs: 2,
        finish_timeout_secs: 2,
        ..AsrConfig::default()
    }
}

async fn next_json(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Binary(_) => panic!("expected a command, got audio"),
            _ => continue,
        }
    }
}

fn event(name: &str, task_id: &str) -> Message {
    Message::text(json!({"header": {"event": name, "task_id": task_id}, "payload": {}}).to_string())
}

fn sentence(task_id: &str, text: &str, end: bool, heartbeat: bool) -> Message {
    Message::text(
        json!({
            "header": {"event": "result-generated", "task_id": task_id},
            "payload": {"output": {"sentence": {"text": text, "sentence_end": end, "heartbeat": heartbeat}}}
        })
        .to_string(),
    )
}

async fn drain(ws: &mut ServerSocket) {
    while let Some(Ok(_)) = ws.next().await {}
}

#[tokio::test]
async fn streams_audio_and_delivers_transcripts() {
    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let seen = received.clone();

    let url = spawn_upstream(move |mut ws| async move {
        let run = next_json(&mut ws).await;
        assert_eq!(run["header"]["action"], "run-task");
        assert_eq!(run["header"]["streaming"], "duplex");
        assert_eq!(run["payload"]["task"], "asr");
        assert_eq!(run["payload"]["model"], "paraformer-realtime-v2");
        assert_eq!(run["payload"]["parameters"]["sample_rate"], 16000);
        assert_eq!(run["payload"]["parameters"]["heartbeat"], true);
        let task_id = run["header"]["task_id"].as_str().unwrap().to_string();

        ws.send(event("task-started", &task_id)).await.unwrap();

        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => seen.lock().unwrap().push(data.to_vec()),
                Message::Text(text) => {
                    let cmd: Value = serde_json::from_str(text.as_str()).unwrap();
                    assert_eq!(cmd["header"]["action"], "finish-task");
                    assert_eq!(cmd["header"]["task_id"], task_id.as_str());
                    break;
                }
                _ => {}
            }
        }

        ws.send(sentence(&task_id, "", false, true)).await.unwrap();
        ws.send(sentence(&task_id, "hello", false, false)).await.unwrap();
        ws.send(Message::text("{garbage")).await.unwrap();
        ws.send(sentence(&task_id, "hello world", true, false)).await.unwrap();
        ws.send(event("task-finished", &task_id)).await.unwrap();
        drain(&mut ws).await;
    })
    .await;

    let adapter = AsrAdapter::new(config(url), "sk-test");
    let (audio_tx, audio_rx) = mpsc::channel(8);
    let (text_tx, mut text_rx) = mpsc::channel(8);

    for chunk in [&b"\x01\x02"[..], &b"\x03"[..], &b"\x04\x05\x06"[..]] {
        audio_tx.send(Bytes::copy_from_slice(chunk)).await.unwrap();
    }
    drop(audio_tx);

    adapter
        .recognize(audio_rx, text_tx, CancellationToken::new())
        .await
        .unwrap();

    let mut transcripts = Vec::new();
    while let Some(t) = text_rx.recv().await {
        transcripts.push(t);
    }
    assert_eq!(
        transcripts,
        vec![
            Transcript {
                text: "hello".into(),
                sentence_end: false
            },
            Transcript {
                text: "hello world".into(),
                sentence_end: true
            },
        ]
    );
    assert_eq!(
        *received.lock().unwrap(),
        vec![vec![1, 2], vec![3], vec![4, 5, 6]]
    );
}

#[tokio::test]
async fn task_failed_mid_stream_fails_the_session() {
    let url = spawn_upstream(|mut ws| async move {
        let run = next_json(&mut ws).await;
        let task_id = run["header"]["task_id"].as_str().unwrap().to_string();
        ws.send(event("task-started", &task_id)).await.unwrap();

        // Wait for the first audio frame, then fail.
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_binary() {
                break;
            }
        }
        let failed = json!({"header": {
            "event": "task-failed",
            "task_id": task_id,
            "error_code": "ClientError",
            "error_message": "audio format mismatch"
        }});
        ws.send(Message::text(failed.to_string())).await.unwrap();
        drain(&mut ws).await;
    })
    .await;

    let adapter = AsrAdapter::new(config(url), "sk-test");
    let (audio_tx, audio_rx) = mpsc::channel(8);
    let (text_tx, _text_rx) = mpsc::channel(8);
    audio_tx.send(Bytes::from_static(b"pcm")).await.unwrap();

    // The sender stays open: the failure must end the session on its own.
    let err = adapter
        .recognize(audio_rx, text_tx, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        VoiceError::TaskFailed { code, message } => {
            assert_eq!(code, "ClientError");
            assert_eq!(message, "audio format mismatch");
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    drop(audio_tx);
}

#[tokio::test]
async fn rejected_start_is_reported() {
    let url = spawn_upstream(|mut ws| async move {
        let _ = next_json(&mut ws).await;
        let failed = json!({"header": {"event": "task-failed", "error_code": "InvalidApiKey"}});
        ws.send(Message::text(failed.to_string())).await.unwrap();
        drain(&mut ws).await;
    })
    .await;

    let adapter = AsrAdapter::new(config(url), "sk-bad");
    let (_audio_tx, audio_rx) = mpsc::channel(1);
    let (text_tx, _text_rx) = mpsc::channel(1);

    let err = adapter
        .recognize(audio_rx, text_tx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, VoiceError::TaskFailed { ref code, .. } if code == "InvalidApiKey"),
        "got {:?}",
        err
    );
}

#[tokio::test]
async fn cancellation_ends_an_idle_session() {
    let url = spawn_upstream(|mut ws| async move {
        let run = next_json(&mut ws).await;
        let task_id = run["header"]["task_id"].as_str().unwrap().to_string();
        ws.send(event("task-started", &task_id)).await.unwrap();
        drain(&mut ws).await;
    })
    .await;

    let adapter = AsrAdapter::new(config(url), "sk-test");
    let (_audio_tx, audio_rx) = mpsc::channel(1);
    let (text_tx, _text_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = adapter
        .recognize(audio_rx, text_tx, cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "got {:?}", err);
}
