use std::io;

use comms::{
    Deserialize, Serialize,
    msg::{Command, Msg, Payload},
    specs::WorkerStatus,
};
use tokio::io as tokio_io;

struct Text<'a>(&'a str);

impl<'a> Serialize<'a> for Text<'_> {
    fn serialize(&'a self, _buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        Some(self.0.as_bytes())
    }
}

impl<'a> Deserialize<'a> for Text<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        std::str::from_utf8(buf)
            .map(Self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[tokio::test]
async fn send_recv_custom_frame() -> io::Result<()> {
    let (one, two) = tokio_io::duplex(128);
    let (rx, tx) = tokio_io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);

    tx.send(&Text("Hello, world!")).await?;

    let (rx, tx) = tokio_io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let got: Text = rx.recv_into(&mut buf).await?;
    assert_eq!(got.0, "Hello, world!");
    Ok(())
}

#[tokio::test]
async fn request_then_values_keep_their_order() -> io::Result<()> {
    let (one, two) = tokio_io::duplex(4096);
    let (rx, tx) = tokio_io::split(one);
    let (_, mut tx) = comms::channel(rx, tx);
    let (peer_rx, peer_tx) = tokio_io::split(two);
    let (mut rx, _) = comms::channel(peer_rx, peer_tx);

    let values = [0.5f32, 1.5, 2.5, 3.5];
    let status = WorkerStatus {
        rank: 3,
        phase: "running".into(),
        global_step: 42,
    };

    tx.send(&Msg::Control(Command::Assign { name: "global/w".into() })).await?;
    tx.send(&Msg::Data(Payload::Values(&values))).await?;
    tx.send(&Msg::Control(Command::Report(status.clone()))).await?;
    tx.send(&Msg::Err("variable `x` is not initialized".into())).await?;

    let mut buf: Vec<u32> = Vec::new();

    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, Msg::Control(Command::Assign { name: "global/w".into() }));

    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, Msg::Data(Payload::Values(&values)));

    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert_eq!(msg, Msg::Control(Command::Report(status)));

    let msg: Msg = rx.recv_into(&mut buf).await?;
    assert!(matches!(msg, Msg::Err(text) if text.contains("not initialized")));
    Ok(())
}

#[tokio::test]
async fn closed_stream_is_an_error() {
    let (one, two) = tokio_io::duplex(64);
    drop(one);

    let (rx, tx) = tokio_io::split(two);
    let (mut rx, _) = comms::channel(rx, tx);

    let mut buf: Vec<u32> = Vec::new();
    let err = rx.recv_into::<Msg, _>(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}
