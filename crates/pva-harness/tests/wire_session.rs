//! A hand-driven big-endian client session against a real server.
//!
//! Every message this test sends is encoded big-endian while the server
//! (on typical hardware) replies little-endian; both directions parse
//! because each header declares its own byte order. This pins down the
//! byte-order negotiation contract end to end.

use std::time::Duration;

use pva_harness::TestCluster;
use pva_proto::{
    BitSet, ByteOrder, Command, HEADER_SIZE, Header, IntrospectionRegistry, PvValue, Reader,
    Role, SubCommand, Writer,
    payloads::{
        channel::{CreateChannelRequest, CreateChannelResponse},
        operation::{DataResponse, OperationInit, OperationInitAck, RequestHeader},
        session::{ConnectionValidated, ValidationRequest, ValidationResponse},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

async fn read_frame(stream: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut header_bytes = [0u8; HEADER_SIZE];
    timeout(WAIT, stream.read_exact(&mut header_bytes)).await.unwrap().unwrap();
    let header = Header::decode(&header_bytes).unwrap();
    let mut payload = vec![0u8; header.payload_size as usize];
    if !payload.is_empty() {
        timeout(WAIT, stream.read_exact(&mut payload)).await.unwrap().unwrap();
    }
    (header, payload)
}

/// Skip informational frames until the wanted command arrives.
async fn read_command(stream: &mut TcpStream, command: Command) -> (Header, Vec<u8>) {
    loop {
        let (header, payload) = read_frame(stream).await;
        if header.control {
            continue;
        }
        if header.command == command.to_u8() {
            return (header, payload);
        }
    }
}

fn big_endian_frame(command: Command, build: impl FnOnce(&mut Writer<'_>)) -> Vec<u8> {
    let mut payload = Vec::new();
    build(&mut Writer::new(&mut payload, ByteOrder::Big));
    let mut framed = Vec::new();
    Header::data(command.to_u8(), Role::Client, ByteOrder::Big, payload.len() as u32)
        .encode(&mut framed);
    framed.extend_from_slice(&payload);
    framed
}

#[tokio::test]
async fn big_endian_client_session() {
    let cluster = TestCluster::start().await.unwrap();
    cluster.add_int_record("int1", 42);

    let mut stream = TcpStream::connect(cluster.server.tcp_addr()).await.unwrap();

    // server speaks first: the validation request, in its native order
    let (header, payload) = read_command(&mut stream, Command::ConnectionValidation).await;
    let request =
        ValidationRequest::decode(&mut Reader::new(&payload, header.order)).unwrap();
    assert!(request.auth_plugins.iter().any(|p| p == "anonymous"));

    // we answer big-endian
    let response = ValidationResponse {
        client_receive_buffer_size: 1 << 16,
        client_registry_size: 1024,
        auth_plugin: "anonymous".into(),
        auth_data: None,
    };
    let frame = big_endian_frame(Command::ConnectionValidation, |w| response.encode(w));
    stream.write_all(&frame).await.unwrap();

    let (header, payload) = read_command(&mut stream, Command::ConnectionValidated).await;
    let validated =
        ConnectionValidated::decode(&mut Reader::new(&payload, header.order)).unwrap();
    assert!(validated.status.is_success());

    // create the channel, still big-endian
    let create = CreateChannelRequest { channels: vec![(1, "int1".into())] };
    let frame = big_endian_frame(Command::CreateChannel, |w| create.encode(w));
    stream.write_all(&frame).await.unwrap();

    let (header, payload) = read_command(&mut stream, Command::CreateChannel).await;
    let created =
        CreateChannelResponse::decode(&mut Reader::new(&payload, header.order)).unwrap();
    assert!(created.status.is_success());
    assert_eq!(created.client_id, 1);
    let sid = created.server_id;
    assert_ne!(sid, 0);

    // negotiate a get of the value field
    let init = OperationInit {
        header: RequestHeader::new(sid, 7, SubCommand::INIT),
        request: "field(value)".into(),
    };
    let frame = big_endian_frame(Command::Get, |w| init.encode(w));
    stream.write_all(&frame).await.unwrap();

    let mut registry = IntrospectionRegistry::new();
    let (header, payload) = read_command(&mut stream, Command::Get).await;
    let ack = OperationInitAck::decode(&mut registry, &mut Reader::new(&payload, header.order))
        .unwrap();
    assert!(ack.status.is_success());
    let desc = match &ack.interfaces[..] {
        [pva_proto::FieldDesc::Structure(desc)] => desc.clone(),
        other => panic!("unexpected interfaces: {other:?}"),
    };

    // execute the get
    let exec = RequestHeader::new(sid, 7, SubCommand::GET);
    let frame = big_endian_frame(Command::Get, |w| exec.encode(w));
    stream.write_all(&frame).await.unwrap();

    let (header, payload) = read_command(&mut stream, Command::Get).await;
    let data = DataResponse::decode(&desc, &mut Reader::new(&payload, header.order)).unwrap();
    assert!(data.header.status.is_success());
    let data = data.data.unwrap();
    assert_eq!(data.value.get("value").and_then(PvValue::as_i32), Some(42));
    assert_eq!(data.changed, BitSet::from_bits([0, 1]));
}
