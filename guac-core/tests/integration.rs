//! End-to-end scenarios over a mock tunnel and recording surfaces: the
//! connection handshake, frame-synchronized drawing, stream lifecycles,
//! chained failover, and audio reassembly.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing_subscriber::EnvFilter;

use guac_core::audio::{AudioFormat, PcmSink};
use guac_core::client::{Client, ClientState, MouseState};
use guac_core::config::ClientConfig;
use guac_core::instruction::Instruction;
use guac_core::status::{Status, StatusCode};
use guac_core::stream::BlobReader;
use guac_core::tunnel::{ChainedTunnel, Tunnel, TunnelEvent, TunnelState};

use common::{MockRemote, MockScript, MockTunnel, SentLog, TestFactory};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Build a client over a default mock tunnel, returning the test handles.
fn mock_client() -> (Client, MockRemote, SentLog, TestFactory) {
    let tunnel = MockTunnel::new(MockScript::default());
    let remote = tunnel.remote();
    let sent = tunnel.sent();
    let factory = TestFactory::new();
    let client = Client::new(
        Box::new(tunnel),
        Box::new(factory.clone()),
        ClientConfig::default(),
    )
    .unwrap();
    (client, remote, sent, factory)
}

fn state_log(client: &mut Client) -> Arc<Mutex<Vec<ClientState>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler_log = Arc::clone(&log);
    client.handlers_mut().on_state_change = Some(Box::new(move |state| {
        handler_log.lock().unwrap().push(state);
    }));
    log
}

// ── Scenario: handshake ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn handshake_reaches_connected_and_keepalive_echoes() {
    init_tracing();
    let tunnel = MockTunnel::new(MockScript::default());
    let remote = tunnel.remote();
    let sent = tunnel.sent();
    let connect_data = Arc::clone(&tunnel.connect_data);
    let factory = TestFactory::new();
    let mut client = Client::new(
        Box::new(tunnel),
        Box::new(factory),
        ClientConfig::default(),
    )
    .unwrap();
    let states = state_log(&mut client);

    client.connect("tok").await.unwrap();
    assert_eq!(connect_data.lock().unwrap().as_deref(), Some("tok"));
    remote.send_wire("4.sync,1.0;");
    client.pump().await;

    assert_eq!(
        *states.lock().unwrap(),
        [
            ClientState::Connecting,
            ClientState::Waiting,
            ClientState::Connected,
        ]
    );
    // The first sync carries the initial timestamp; no echo yet.
    assert!(!sent.contains("4.sync,1.0;"));

    // The next 5-second keep-alive echoes the last-received timestamp.
    client.step().await;
    assert!(sent.contains("4.sync,1.0;"));
}

// ── Scenario: draw and sync ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sync_waits_for_blocked_image_draws() {
    let (mut client, remote, sent, factory) = mock_client();

    client.connect("").await.unwrap();
    remote.send_wire("3.png,1.0,1.0,1.0,1.0,4.AAAA;");
    remote.send_wire("3.png,1.0,1.0,1.0,2.10,4.BBBB;");
    client.pump().await;

    // Two blocked draw tasks (plus their channel-mask tasks) are pending;
    // both decodes are outstanding.
    assert_eq!(client.display().pending_tasks(), 4);
    assert_eq!(factory.pending_decodes(), 2);

    remote.send_wire("4.sync,2.10;");
    client.pump().await;

    // The frame is sealed but cannot run: nothing drawn, no sync echo.
    assert_eq!(client.display().queued_frames(), 1);
    assert_eq!(factory.op_count("draw_bitmap"), 0);
    assert!(!sent.contains("4.sync,2.10;"));

    // First image loads: still blocked on the second.
    factory.complete_decode();
    client.pump().await;
    assert!(!sent.contains("4.sync,2.10;"));

    // Second image loads: the frame paints atomically and sync echoes.
    factory.complete_decode();
    client.pump().await;
    assert_eq!(factory.op_count("draw_bitmap"), 2);
    assert_eq!(client.display().queued_frames(), 0);
    assert!(sent.contains("4.sync,2.10;"));
}

// ── Scenario: stream lifecycle ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn file_stream_delivers_blobs_and_acks() {
    let (mut client, remote, sent, _factory) = mock_client();

    let received = Arc::new(Mutex::new(None));
    let reader_slot: Arc<Mutex<Option<BlobReader>>> = Arc::new(Mutex::new(None));
    let blob_count = Arc::new(AtomicUsize::new(0));
    let ended = Arc::new(AtomicBool::new(false));
    {
        let received = Arc::clone(&received);
        let reader_slot = Arc::clone(&reader_slot);
        let blob_count = Arc::clone(&blob_count);
        let ended = Arc::clone(&ended);
        client.handlers_mut().on_file = Some(Box::new(move |stream, mimetype, filename| {
            *received.lock().unwrap() = Some((mimetype.to_string(), filename.to_string()));
            let reader = BlobReader::attach(&stream, mimetype);
            {
                let blob_count = Arc::clone(&blob_count);
                reader.on_progress(move |_bytes| {
                    blob_count.fetch_add(1, Ordering::SeqCst);
                });
            }
            {
                let ended = Arc::clone(&ended);
                reader.on_end(move || ended.store(true, Ordering::SeqCst));
            }
            *reader_slot.lock().unwrap() = Some(reader);
        }));
    }

    client.connect("").await.unwrap();
    remote.send_wire("4.file,1.1,10.text/plain,5.a.txt;");
    remote.send_wire("4.blob,1.1,8.SGVsbG8=;");
    remote.send_wire("3.end,1.1;");
    client.pump().await;

    assert_eq!(
        *received.lock().unwrap(),
        Some(("text/plain".to_string(), "a.txt".to_string()))
    );
    assert_eq!(blob_count.load(Ordering::SeqCst), 1);
    assert!(ended.load(Ordering::SeqCst));
    // The reader acknowledged the blob.
    assert!(sent.contains("3.ack,1.1,2.OK,1.0;"));

    let reader = reader_slot.lock().unwrap().take().unwrap();
    assert_eq!(reader.take_data(), b"Hello");
}

#[tokio::test(start_paused = true)]
async fn unhandled_clipboard_is_rejected() {
    let (mut client, remote, sent, _factory) = mock_client();
    client.connect("").await.unwrap();
    remote.send_wire("9.clipboard,1.5,10.text/plain;");
    client.pump().await;
    assert!(sent.contains("3.ack,1.5,21.Clipboard unsupported,3.256;"));
}

// ── Scenario: chained failover ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn chained_failover_commits_second_tunnel() {
    init_tracing();

    let a = MockTunnel::new(MockScript {
        open_on_connect: false,
        events: vec![
            TunnelEvent::Error(Status::from_code(StatusCode::ServerError)),
            TunnelEvent::State(TunnelState::Closed),
        ],
        fail_connect: None,
    });
    let b = MockTunnel::new(MockScript {
        open_on_connect: true,
        events: vec![
            TunnelEvent::Instruction(Instruction::of("name", &["test"])),
            TunnelEvent::Error(Status::from_code(StatusCode::ServerError)),
            TunnelEvent::State(TunnelState::Closed),
        ],
        fail_connect: None,
    });
    let c = MockTunnel::new(MockScript::default());
    let c_connected = Arc::clone(&c.connect_called);

    let chained = ChainedTunnel::new(vec![Box::new(a), Box::new(b), Box::new(c)]);
    let factory = TestFactory::new();
    let mut client = Client::new(
        Box::new(chained),
        Box::new(factory.clone()),
        ClientConfig::default(),
    )
    .unwrap();

    let names = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let names = Arc::clone(&names);
        client.handlers_mut().on_name = Some(Box::new(move |name| {
            names.lock().unwrap().push(name.to_string());
        }));
    }
    {
        let errors = Arc::clone(&errors);
        client.handlers_mut().on_error = Some(Box::new(move |status| {
            errors.lock().unwrap().push(status.raw());
        }));
    }

    client.connect("tok").await.unwrap();
    tokio::time::timeout(Duration::from_secs(120), client.run())
        .await
        .expect("client must disconnect once the committed tunnel closes");

    // The second tunnel committed and its traffic flowed through.
    assert_eq!(*names.lock().unwrap(), ["test"]);
    // Only the post-commit error surfaced; the first tunnel's pre-commit
    // failure was consumed by failover.
    assert_eq!(
        *errors.lock().unwrap(),
        [StatusCode::ServerError as i32]
    );
    // The third tunnel was never attempted.
    assert!(!c_connected.load(Ordering::SeqCst));
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn upstream_timeout_stops_failover() {
    let a = MockTunnel::new(MockScript {
        open_on_connect: false,
        events: vec![TunnelEvent::Error(Status::from_code(
            StatusCode::UpstreamTimeout,
        ))],
        fail_connect: None,
    });
    let b = MockTunnel::new(MockScript::default());
    let c = MockTunnel::new(MockScript::default());
    let b_connected = Arc::clone(&b.connect_called);
    let c_connected = Arc::clone(&c.connect_called);

    let mut chained = ChainedTunnel::new(vec![Box::new(a), Box::new(b), Box::new(c)]);
    let mut events = chained.take_events().unwrap();
    chained.connect("x").await.unwrap();

    let mut saw_timeout = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("chained tunnel must close")
            .expect("event stream must stay open until close");
        match event {
            TunnelEvent::Error(status) => {
                assert_eq!(status.code(), Some(StatusCode::UpstreamTimeout));
                saw_timeout = true;
            }
            TunnelEvent::State(TunnelState::Closed) => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_timeout);
    // A timeout means no other transport will fare better.
    assert!(!b_connected.load(Ordering::SeqCst));
    assert!(!c_connected.load(Ordering::SeqCst));
}

// ── Scenario: audio split ────────────────────────────────────────

struct RecordingSink {
    received: Arc<Mutex<Vec<u8>>>,
}

impl PcmSink for RecordingSink {
    fn play(&mut self, _format: &AudioFormat, pcm: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(pcm);
    }
}

#[tokio::test(start_paused = true)]
async fn raw_audio_reassembles_split_payload() {
    let (mut client, remote, sent, _factory) = mock_client();

    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        client.register_audio_sink(Box::new(move |_format| {
            Box::new(RecordingSink {
                received: Arc::clone(&received),
            })
        }));
    }

    client.connect("").await.unwrap();
    remote.send_instruction(Instruction::of("audio", &["0", "audio/L16;rate=8000"]));
    client.pump().await;
    // The built-in player accepted the stream.
    assert!(sent.contains("3.ack,1.0,2.OK,1.0;"));

    // 20 000 bytes of PCM split exactly as the wire maximum dictates.
    for size in [8064usize, 8064, 3872] {
        let blob = BASE64.encode(vec![0x11u8; size]);
        remote.send_instruction(Instruction::of("blob", &["0", &blob]));
    }
    remote.send_instruction(Instruction::of("end", &["0"]));
    remote.send_instruction(Instruction::of("sync", &["42"]));
    client.pump().await;

    // All 20 000 bytes reached the sink: 10 000 16-bit samples at 8 kHz.
    assert_eq!(received.lock().unwrap().len(), 20_000);
    assert_eq!(received.lock().unwrap().len() / 2, 10_000);
    assert!(sent.contains("4.sync,2.42;"));
}

#[tokio::test(start_paused = true)]
async fn unsupported_audio_mimetype_is_bad_type() {
    let (mut client, remote, sent, _factory) = mock_client();
    client.connect("").await.unwrap();
    remote.send_instruction(Instruction::of("audio", &["2", "audio/ogg"]));
    client.pump().await;
    // 0x030F = 783.
    assert!(sent.contains("3.ack,1.2,8.BAD TYPE,3.783;"));
}

// ── Error instruction / disconnect ───────────────────────────────

#[tokio::test(start_paused = true)]
async fn server_error_instruction_disconnects() {
    let (mut client, remote, sent, _factory) = mock_client();
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        client.handlers_mut().on_error = Some(Box::new(move |status| {
            errors
                .lock()
                .unwrap()
                .push((status.raw(), status.message().unwrap_or("").to_string()));
        }));
    }

    client.connect("").await.unwrap();
    remote.send_wire("5.error,4.oops,3.519;");
    client.pump().await;

    assert_eq!(*errors.lock().unwrap(), [(519, "oops".to_string())]);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(sent.contains("10.disconnect;"));
}

#[tokio::test(start_paused = true)]
async fn tunnel_error_and_close_reach_the_client() {
    let (mut client, remote, _sent, _factory) = mock_client();
    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        client.handlers_mut().on_error = Some(Box::new(move |status| {
            errors.lock().unwrap().push(status.raw());
        }));
    }

    client.connect("").await.unwrap();
    remote.error(Status::from_code(StatusCode::UpstreamError));
    remote.close();
    client.pump().await;

    assert_eq!(*errors.lock().unwrap(), [StatusCode::UpstreamError as i32]);
    assert_eq!(client.state(), ClientState::Disconnected);
}

// ── Input events ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn input_events_are_gated_on_connection() {
    let (mut client, _remote, sent, _factory) = mock_client();
    let handle = client.handle();

    // Not connected: everything is dropped.
    handle.send_key(0xFF0D, true);
    handle.send_mouse_state(&MouseState {
        x: 10,
        y: 20,
        buttons: MouseState::BUTTON_LEFT,
    });
    assert!(sent.drain().is_empty());

    client.connect("").await.unwrap();
    handle.send_key(0xFF0D, true);
    handle.send_key(0xFF0D, false);
    handle.send_mouse_state(&MouseState {
        x: 10,
        y: 20,
        buttons: MouseState::BUTTON_LEFT,
    });
    handle.send_size(1024, 768);

    assert!(sent.contains("3.key,5.65293,1.1;"));
    assert!(sent.contains("3.key,5.65293,1.0;"));
    assert!(sent.contains("5.mouse,2.10,2.20,1.1;"));
    assert!(sent.contains("4.size,4.1024,3.768;"));
}

// ── Scene-graph instructions over the wire ───────────────────────

#[tokio::test(start_paused = true)]
async fn drawing_instructions_reach_surfaces_in_frame_order() {
    let (mut client, remote, _sent, factory) = mock_client();
    client.connect("").await.unwrap();

    remote.send_wire("4.size,1.0,3.640,3.480;");
    remote.send_wire("4.rect,1.0,1.0,1.0,2.64,2.32;");
    remote.send_wire("5.cfill,2.14,1.0,3.255,1.0,1.0,3.255;");
    client.pump().await;
    // Nothing runs before the sync flush.
    assert_eq!(factory.op_count("fill_color"), 0);

    remote.send_wire("4.sync,1.7;");
    client.pump().await;

    let ops = factory.ops();
    let resize = ops.iter().position(|op| op.contains("resize 640x480"));
    let rect = ops.iter().position(|op| op.contains("rect 0 0 64 32"));
    let fill = ops.iter().position(|op| op.contains("fill_color 255 0 0 255"));
    assert!(resize.is_some() && rect.is_some() && fill.is_some());
    assert!(resize < rect && rect < fill);
}

#[tokio::test(start_paused = true)]
async fn unknown_opcodes_are_ignored() {
    let (mut client, remote, _sent, _factory) = mock_client();
    client.connect("").await.unwrap();
    remote.send_wire("7.unknown,1.0,3.abc;");
    client.pump().await;
    assert_eq!(client.state(), ClientState::Waiting);
}

// ── Named objects ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn filesystem_object_round_trip() {
    let (mut client, remote, sent, _factory) = mock_client();

    let object_slot = Arc::new(Mutex::new(None));
    {
        let object_slot = Arc::clone(&object_slot);
        client.handlers_mut().on_filesystem = Some(Box::new(move |object, name| {
            assert_eq!(name, "shared-drive");
            *object_slot.lock().unwrap() = Some(object);
        }));
    }

    client.connect("").await.unwrap();
    remote.send_wire("10.filesystem,1.3,12.shared-drive;");
    client.pump().await;

    let object = object_slot.lock().unwrap().clone().unwrap();
    assert_eq!(object.index(), 3);

    // Request the root stream; the matching body resolves the callback.
    let body = Arc::new(Mutex::new(None));
    {
        let body = Arc::clone(&body);
        object.request_input_stream(guac_core::client::ROOT_STREAM, move |stream, mimetype| {
            *body.lock().unwrap() = Some((stream.index(), mimetype));
        });
    }
    assert!(sent.contains("3.get,1.3,1./;"));

    remote.send_instruction(Instruction::of(
        "body",
        &[
            "3",
            "8",
            guac_core::client::STREAM_INDEX_MIMETYPE,
            guac_core::client::ROOT_STREAM,
        ],
    ));
    client.pump().await;

    assert_eq!(
        *body.lock().unwrap(),
        Some((
            8,
            "application/vnd.glyptodon.guacamole.stream-index+json".to_string()
        ))
    );
}

// ── Output streams ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn clipboard_stream_is_freed_on_error_ack() {
    let (mut client, remote, sent, _factory) = mock_client();
    client.connect("").await.unwrap();

    let stream = client.create_clipboard_stream("text/plain");
    assert_eq!(stream.index(), 0);
    assert!(sent.contains("9.clipboard,1.0,10.text/plain;"));

    let acks = Arc::new(Mutex::new(Vec::new()));
    {
        let acks = Arc::clone(&acks);
        stream.set_on_ack(move |status| acks.lock().unwrap().push(status.raw()));
    }

    // An error-class ack destroys the stream and recycles its index.
    remote.send_instruction(Instruction::of("ack", &["0", "FAIL", "516"]));
    client.pump().await;
    assert_eq!(*acks.lock().unwrap(), [516]);

    let next = client.create_file_stream("application/octet-stream", "out.bin");
    assert_eq!(next.index(), 0);
}
