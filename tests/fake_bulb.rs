// End-to-end tests of the Tuya link against a simulated bulb listening on
// the loopback interface.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::sleep;

use tuya_bulb_panel::tuya::crypt::Cipher;
use tuya_bulb_panel::tuya::frame::{read_frame, Command, Frame};
use tuya_bulb_panel::tuya::VERSION_HEADER_LEN;
use tuya_bulb_panel::{
    BulbConfig, DeviceLink, DeviceSession, Error, LocalKey, ProtocolVersion, SessionOptions,
    TuyaLink,
};

const KEY: &str = "0123456789abcdef";
const DEVICE_ID: &str = "bf91c81918a901700a0abp";

#[derive(Clone)]
struct FakeBulb {
    dps: Value,
    // Answers plain status queries with "data unvalid".
    device22: bool,
    // Indexes of status queries to leave unanswered.
    ignore_queries: Vec<usize>,
    // Indexes of status queries answered only after 300 ms.
    late_queries: Vec<usize>,
    // Indexes of status queries whose reply is sent in two parts, 250 ms
    // apart.
    split_queries: Vec<usize>,
    // Reports brightness (index + 1) * 100 for each status query.
    count_queries: bool,
}

impl FakeBulb {
    fn new() -> Self {
        FakeBulb {
            dps: json!({"20": true, "21": "white", "22": 640, "23": 250}),
            device22: false,
            ignore_queries: Vec::new(),
            late_queries: Vec::new(),
            split_queries: Vec::new(),
            count_queries: false,
        }
    }
}

fn versioned(body: Vec<u8>) -> Vec<u8> {
    let mut out = b"3.3".to_vec();
    out.resize(VERSION_HEADER_LEN, 0);
    out.extend_from_slice(&body);
    out
}

fn open(cipher: &Cipher, payload: &[u8]) -> Value {
    let data = if payload.starts_with(b"3.3") {
        &payload[VERSION_HEADER_LEN..]
    } else {
        payload
    };
    let clear = cipher.decrypt(data).expect("request is not encrypted with the local key");
    serde_json::from_slice(&clear).unwrap()
}

fn reply(seq: u32, command: Command, ret_code: Option<u32>, payload: Vec<u8>) -> Frame {
    Frame {
        seq,
        command,
        ret_code,
        payload,
    }
}

// Serves a single connection. Every decoded request is forwarded to `log`.

async fn spawn_bulb(bulb: FakeBulb) -> (u16, mpsc::UnboundedReceiver<(Command, Value)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (log, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let cipher = Cipher::new(KEY.as_bytes()).unwrap();
        let mut dps = bulb.dps.clone();
        let mut queries = 0;

        while let Ok(frame) = read_frame(&mut sock, false).await {
            let body = open(&cipher, &frame.payload);
            let _ = log.send((frame.command, body.clone()));

            let replies = match frame.command {
                Command::DpQuery => {
                    let index = queries;
                    queries += 1;

                    if bulb.ignore_queries.contains(&index) {
                        vec![]
                    } else if bulb.device22 {
                        vec![reply(
                            frame.seq,
                            Command::DpQuery,
                            Some(0),
                            b"json obj data unvalid".to_vec(),
                        )]
                    } else {
                        if bulb.count_queries {
                            dps["22"] = json!((index + 1) * 100);
                        }

                        let msg = json!({"devId": DEVICE_ID, "dps": dps});
                        let out = reply(
                            frame.seq,
                            Command::DpQuery,
                            Some(0),
                            cipher.encrypt(msg.to_string().as_bytes()),
                        )
                        .encode();

                        if bulb.late_queries.contains(&index) {
                            sleep(Duration::from_millis(300)).await;
                        }
                        if bulb.split_queries.contains(&index) {
                            if sock.write_all(&out[..20]).await.is_err() {
                                return;
                            }
                            sleep(Duration::from_millis(250)).await;
                            if sock.write_all(&out[20..]).await.is_err() {
                                return;
                            }
                        } else if sock.write_all(&out).await.is_err() {
                            return;
                        }
                        vec![]
                    }
                }
                Command::ControlNew => {
                    let msg = json!({"devId": DEVICE_ID, "dps": dps});
                    vec![reply(
                        frame.seq,
                        Command::ControlNew,
                        None,
                        versioned(cipher.encrypt(msg.to_string().as_bytes())),
                    )]
                }
                Command::Control => {
                    if let (Some(state), Some(update)) =
                        (dps.as_object_mut(), body["dps"].as_object())
                    {
                        state.extend(update.clone());
                    }
                    vec![
                        reply(0, Command::HeartBeat, Some(0), vec![]),
                        reply(frame.seq, Command::Control, Some(0), vec![]),
                    ]
                }
                _ => vec![],
            };

            for f in replies {
                if sock.write_all(&f.encode()).await.is_err() {
                    return;
                }
            }
        }
    });

    (port, rx)
}

fn config(device_id: &str) -> BulbConfig {
    BulbConfig {
        device_id: device_id.to_string(),
        ip_address: "127.0.0.1".to_string(),
        local_key: LocalKey::new(KEY),
        version: ProtocolVersion::V3_3,
    }
}

fn options(port: u16) -> SessionOptions {
    SessionOptions {
        timeout: Duration::from_millis(200),
        retry_limit: 1,
        port,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<(Command, Value)>) -> Vec<(Command, Value)> {
    let mut out = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        out.push(entry);
    }
    out
}

#[tokio::test]
async fn test_connect_and_read_state() {
    let (port, mut rx) = spawn_bulb(FakeBulb::new()).await;
    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));

    session.connect().await.unwrap();
    let state = session.state().await.unwrap();

    assert!(state.power);
    assert_eq!(state.brightness, 640);
    assert_eq!(state.temperature, 3650);

    let requests = drain(&mut rx);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0, Command::DpQuery);
    assert_eq!(requests[0].1["gwId"], DEVICE_ID);
    assert_eq!(requests[0].1["devId"], DEVICE_ID);
}

#[tokio::test]
async fn test_control_skips_unsolicited_frames() {
    let (port, mut rx) = spawn_bulb(FakeBulb::new()).await;
    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));

    session.connect().await.unwrap();
    session.set_power(false).await.unwrap();
    session.set_combined(true, 800, 1000).await.unwrap();

    let controls: Vec<Value> = drain(&mut rx)
        .into_iter()
        .filter(|(c, _)| *c == Command::Control)
        .map(|(_, body)| body)
        .collect();

    assert_eq!(controls.len(), 3);
    assert_eq!(controls[0]["dps"], json!({"20": false}));
    assert_eq!(controls[1]["dps"], json!({"20": true}));
    assert_eq!(
        controls[2]["dps"],
        json!({"21": "white", "22": 800, "23": 1000})
    );
    assert_eq!(controls[2]["devId"], DEVICE_ID);

    let state = session.state().await.unwrap();
    assert_eq!(state.brightness, 800);
    assert_eq!(state.temperature, 6500);
}

#[tokio::test]
async fn test_timed_out_query_is_resent() {
    let bulb = FakeBulb {
        ignore_queries: vec![1],
        ..FakeBulb::new()
    };
    let (port, mut rx) = spawn_bulb(bulb).await;
    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));

    session.connect().await.unwrap();
    assert!(session.state().await.is_ok());

    let queries = drain(&mut rx)
        .iter()
        .filter(|(c, _)| *c == Command::DpQuery)
        .count();
    assert_eq!(queries, 3);
}

#[tokio::test]
async fn test_late_reply_does_not_shift_later_reads() {
    let bulb = FakeBulb {
        late_queries: vec![1],
        count_queries: true,
        ..FakeBulb::new()
    };
    let (port, _rx) = spawn_bulb(bulb).await;
    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));

    session.connect().await.unwrap();

    // Query 1 is re-sent as query 2; the late answer to 1 is taken and the
    // answer to 2 is dropped as stale by the next read.
    let first = session.query_state().await.unwrap();
    let second = session.query_state().await.unwrap();
    let third = session.query_state().await.unwrap();

    assert_eq!(first["22"], 200);
    assert_eq!(second["22"], 400);
    assert_eq!(third["22"], 500);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_reply_split_across_timeout_keeps_framing() {
    let bulb = FakeBulb {
        split_queries: vec![1],
        count_queries: true,
        ..FakeBulb::new()
    };
    let (port, _rx) = spawn_bulb(bulb).await;
    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));

    session.connect().await.unwrap();

    assert_eq!(session.query_state().await.unwrap()["22"], 200);
    for expected in [400, 500, 600, 700] {
        assert_eq!(session.query_state().await.unwrap()["22"], expected);
    }

    let status = session.status();
    assert!(status.established);
    assert!(status.responsive);
}

#[tokio::test]
async fn test_timeout_keeps_link() {
    let bulb = FakeBulb {
        ignore_queries: vec![1, 2],
        ..FakeBulb::new()
    };
    let (port, _rx) = spawn_bulb(bulb).await;
    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));

    session.connect().await.unwrap();

    assert!(matches!(session.state().await, Err(Error::Timeout(_))));
    let status = session.status();
    assert!(status.established);
    assert!(!status.responsive);

    assert!(session.state().await.is_ok());
    assert!(session.status().responsive);
}

#[tokio::test]
async fn test_device22_fallback() {
    let bulb = FakeBulb {
        device22: true,
        ..FakeBulb::new()
    };
    let (port, mut rx) = spawn_bulb(bulb).await;
    let mut link = TuyaLink::open(&config(DEVICE_ID), &options(port))
        .await
        .unwrap();

    let dps = link.status().await.unwrap();

    assert!(link.is_device22());
    assert_eq!(dps["22"], 640);

    let requests = drain(&mut rx);
    assert_eq!(requests[0].0, Command::DpQuery);
    assert_eq!(requests[1].0, Command::ControlNew);
    assert_eq!(
        requests[1].1["dps"],
        json!({"20": null, "21": null, "22": null, "23": null})
    );

    // Later queries go straight to the device22 variant.
    link.status().await.unwrap();
    assert_eq!(drain(&mut rx)[0].0, Command::ControlNew);
}

#[tokio::test]
async fn test_short_device_id_does_not_fall_back() {
    let bulb = FakeBulb {
        device22: true,
        ..FakeBulb::new()
    };
    let (port, _rx) = spawn_bulb(bulb).await;
    let mut link = TuyaLink::open(&config("shortid"), &options(port))
        .await
        .unwrap();

    match link.status().await {
        Err(Error::MalformedResponse(msg)) => assert!(msg.contains("data unvalid")),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!link.is_device22());
}

#[tokio::test]
async fn test_connection_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));

    assert!(matches!(
        session.connect().await,
        Err(Error::Connect { .. })
    ));
    assert!(!session.is_connected());
    assert!(matches!(session.state().await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_unsupported_version_is_rejected() {
    let mut cfg = config(DEVICE_ID);
    cfg.version = "3.1".parse().unwrap();

    assert!(matches!(
        TuyaLink::open(&cfg, &options(6668)).await,
        Err(Error::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_bulb_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let cipher = Cipher::new(KEY.as_bytes()).unwrap();
        let (mut sock, _) = listener.accept().await.unwrap();

        // Answer the first status query, then close on the next request.
        let frame = read_frame(&mut sock, false).await.unwrap();
        let msg = json!({"dps": {"20": true}});
        let ack = reply(
            frame.seq,
            Command::DpQuery,
            Some(0),
            cipher.encrypt(msg.to_string().as_bytes()),
        );
        sock.write_all(&ack.encode()).await.unwrap();
        let _ = read_frame(&mut sock, false).await;
    });

    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));
    session.connect().await.unwrap();

    assert!(matches!(session.set_power(false).await, Err(Error::Io(_))));
    assert!(!session.is_connected());
    assert!(matches!(
        session.set_power(true).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_garbage_on_the_wire_drops_link() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let cipher = Cipher::new(KEY.as_bytes()).unwrap();
        let (mut sock, _) = listener.accept().await.unwrap();

        let frame = read_frame(&mut sock, false).await.unwrap();
        let msg = json!({"dps": {"20": true}});
        let ack = reply(
            frame.seq,
            Command::DpQuery,
            Some(0),
            cipher.encrypt(msg.to_string().as_bytes()),
        );
        sock.write_all(&ack.encode()).await.unwrap();

        // Answer the next request with bytes that are not a frame.
        let _ = read_frame(&mut sock, false).await;
        sock.write_all(&[0xde; 32]).await.unwrap();
        let _ = read_frame(&mut sock, false).await;
    });

    let session = DeviceSession::tcp(config(DEVICE_ID), options(port));
    session.connect().await.unwrap();

    assert!(matches!(session.state().await, Err(Error::Desync(_))));
    assert!(!session.status().established);
    assert!(matches!(session.state().await, Err(Error::NotConnected)));
}
