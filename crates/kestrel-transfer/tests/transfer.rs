//! End-to-end transfer scenarios over a loopback RPC link.
//!
//! Both endpoints share one transfer event loop (sessions are disambiguated
//! by side and direction) and the tests run on a paused clock, so timeout
//! paths execute instantly and deterministically.

use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use kestrel_rpc::testing::{drain, FrameQueue, TestOutput};
use kestrel_rpc::{shared_output, Channel, Packet, PacketType, SharedOutput, Status};
use kestrel_transfer::{
    config, Chunk, ChunkType, Client, DynReader, DynWriter, ProtocolVersion, Server,
    TransferThread,
};

#[derive(Clone, Default)]
struct SharedVec(Arc<Mutex<Vec<u8>>>);

impl SharedVec {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl io::Write for SharedVec {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct World {
    rpc_client: Arc<kestrel_rpc::Client>,
    rpc_server: Arc<kestrel_rpc::Server>,
    client: Client,
    server: Server,
    client_frames: FrameQueue,
    server_frames: FrameQueue,
    server_output: SharedOutput,
}

fn world(data_buffer_size: usize, max_bytes_to_receive: u32) -> World {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let (thread, event_loop) = TransferThread::new(data_buffer_size);
    tokio::spawn(event_loop.run());

    let client_output = TestOutput::new(1024);
    let client_frames = client_output.frames();
    let rpc_client = Arc::new(kestrel_rpc::Client::new(vec![Channel::new(
        1,
        shared_output(client_output),
    )]));

    let server_output = TestOutput::new(1024);
    let server_frames = server_output.frames();
    let server_output = shared_output(server_output);
    let rpc_server = Arc::new(kestrel_rpc::Server::new(2));

    let server = Server::new(thread.clone());
    rpc_server.register_service(server.service());

    let client = Client::new(Arc::clone(&rpc_client), 1, thread, max_bytes_to_receive);

    World {
        rpc_client,
        rpc_server,
        client,
        server,
        client_frames,
        server_frames,
        server_output,
    }
}

type PumpFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

fn deliver_all() -> PumpFilter {
    Box::new(|_| true)
}

/// Ferries frames between the endpoints until the test ends. `to_client`
/// may drop frames to model a lossy link.
fn spawn_pump(world: &World, mut to_client: PumpFilter) {
    let rpc_client = Arc::clone(&world.rpc_client);
    let rpc_server = Arc::clone(&world.rpc_server);
    let client_frames = Arc::clone(&world.client_frames);
    let server_frames = Arc::clone(&world.server_frames);
    let server_output = Arc::clone(&world.server_output);

    tokio::spawn(async move {
        loop {
            for frame in drain(&client_frames) {
                let _ = rpc_server.process_packet(&frame, &server_output);
            }
            for frame in drain(&server_frames) {
                if to_client(&frame) {
                    let _ = rpc_client.process_packet(&frame);
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
}

/// Decodes the transfer chunk inside an RPC frame, if there is one.
fn transfer_chunk(frame: &[u8]) -> Option<Chunk> {
    let packet = Packet::decode(frame).ok()?;
    if packet.service_id() != config::TRANSFER_SERVICE_ID {
        return None;
    }
    if !matches!(
        packet.packet_type(),
        PacketType::ServerStream | PacketType::ClientStream
    ) {
        return None;
    }
    Chunk::decode(&Bytes::copy_from_slice(packet.payload())).ok()
}

fn resource_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(start_paused = true)]
async fn read_completes_cleanly() {
    // 256-byte chunks over a 1024-byte resource with a 1024-byte window.
    let world = world(256 + 64, 1024);
    let data = resource_bytes(1024);
    {
        let data = data.clone();
        world
            .server
            .register_read_handler(7, move || {
                Ok(Box::new(Cursor::new(data.clone())) as DynReader)
            })
            .unwrap();
    }

    let delivered: Arc<Mutex<Vec<ChunkType>>> = Arc::default();
    let log = Arc::clone(&delivered);
    spawn_pump(
        &world,
        Box::new(move |frame| {
            if let Some(chunk) = transfer_chunk(frame) {
                log.lock().push(chunk.chunk_type);
            }
            true
        }),
    );

    let output = SharedVec::default();
    let (tx, rx) = oneshot::channel();
    let handle = world
        .client
        .read(7, Box::new(output.clone()) as DynWriter, move |status| {
            let _ = tx.send(status);
        })
        .unwrap();
    assert!(!handle.is_unassigned());

    let status = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .expect("transfer must finish")
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(output.contents(), data);

    let delivered = delivered.lock();
    assert_eq!(delivered[0], ChunkType::StartAck);
    let data_chunks = delivered
        .iter()
        .filter(|ty| **ty == ChunkType::Data)
        .count();
    assert_eq!(data_chunks, 4, "clean run sends each chunk once");
    assert_eq!(*delivered.last().unwrap(), ChunkType::Completion);
}

#[tokio::test(start_paused = true)]
async fn read_recovers_from_one_lost_chunk() {
    let world = world(256 + 64, 1024);
    let data = resource_bytes(1024);
    {
        let data = data.clone();
        world
            .server
            .register_read_handler(7, move || {
                Ok(Box::new(Cursor::new(data.clone())) as DynReader)
            })
            .unwrap();
    }

    // Drop the third data chunk (offset 512) exactly once.
    let dropped = Arc::new(AtomicUsize::new(0));
    let drop_flag = Arc::clone(&dropped);
    spawn_pump(
        &world,
        Box::new(move |frame| {
            if let Some(chunk) = transfer_chunk(frame) {
                if chunk.chunk_type == ChunkType::Data
                    && chunk.offset == 512
                    && drop_flag.fetch_add(1, Ordering::Relaxed) == 0
                {
                    return false;
                }
            }
            true
        }),
    );

    let output = SharedVec::default();
    let (tx, rx) = oneshot::channel();
    world
        .client
        .read(7, Box::new(output.clone()) as DynWriter, move |status| {
            let _ = tx.send(status);
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .expect("transfer must finish")
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(output.contents(), data);
    assert!(dropped.load(Ordering::Relaxed) >= 2, "512 was resent");
}

#[tokio::test(start_paused = true)]
async fn read_survives_periodic_loss() {
    let world = world(256 + 64, 1024);
    let data = resource_bytes(1024);
    {
        let data = data.clone();
        world
            .server
            .register_read_handler(7, move || {
                Ok(Box::new(Cursor::new(data.clone())) as DynReader)
            })
            .unwrap();
    }
    world.client.set_max_retries(5).unwrap();

    // Drop every third data chunk, forever.
    let counter = Arc::new(AtomicUsize::new(0));
    let drop_counter = Arc::clone(&counter);
    spawn_pump(
        &world,
        Box::new(move |frame| {
            if let Some(chunk) = transfer_chunk(frame) {
                if chunk.chunk_type == ChunkType::Data {
                    return drop_counter.fetch_add(1, Ordering::Relaxed) % 3 != 2;
                }
            }
            true
        }),
    );

    let output = SharedVec::default();
    let (tx, rx) = oneshot::channel();
    world
        .client
        .read(7, Box::new(output.clone()) as DynWriter, move |status| {
            let _ = tx.send(status);
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(120), rx)
        .await
        .expect("transfer must finish")
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(output.contents(), data);
}

#[tokio::test(start_paused = true)]
async fn write_happy_path() {
    let world = world(256 + 64, 0);
    let received = SharedVec::default();
    {
        let received = received.clone();
        world
            .server
            .register_write_handler(9, move || {
                Ok(Box::new(received.clone()) as DynWriter)
            })
            .unwrap();
    }
    spawn_pump(&world, deliver_all());

    let data = resource_bytes(1000);
    let (tx, rx) = oneshot::channel();
    world
        .client
        .write(
            9,
            Box::new(Cursor::new(data.clone())) as DynReader,
            move |status| {
                let _ = tx.send(status);
            },
        )
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .expect("transfer must finish")
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(received.contents(), data);
}

#[tokio::test(start_paused = true)]
async fn write_retry_exhaustion_surfaces_deadline_exceeded() {
    // No pump: the server never hears the Start and never answers.
    let world = world(256 + 64, 0);
    world.client.set_max_retries(2).unwrap();

    let (tx, rx) = oneshot::channel();
    world
        .client
        .write(
            9,
            Box::new(Cursor::new(resource_bytes(64))) as DynReader,
            move |status| {
                let _ = tx.send(status);
            },
        )
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(120), rx)
        .await
        .expect("retry budget must expire")
        .unwrap();
    assert_eq!(status, Status::DeadlineExceeded);

    // Initial Start plus exactly two retransmissions, then the local
    // completion notice.
    let starts = drain(&world.client_frames)
        .iter()
        .filter_map(|frame| transfer_chunk(frame))
        .filter(|chunk| chunk.chunk_type == ChunkType::Start)
        .count();
    assert_eq!(starts, 3);
}

#[tokio::test(start_paused = true)]
async fn unregistered_resource_is_refused() {
    let world = world(256 + 64, 0);
    spawn_pump(&world, deliver_all());

    let output = SharedVec::default();
    let (tx, rx) = oneshot::channel();
    world
        .client
        .read(404, Box::new(output) as DynWriter, move |status| {
            let _ = tx.send(status);
        })
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .expect("refusal must surface")
        .unwrap();
    assert_eq!(status, Status::NotFound);
}

#[tokio::test(start_paused = true)]
async fn legacy_read_round_trip() {
    let world = world(256 + 64, 1024);
    let data = resource_bytes(600);
    {
        let data = data.clone();
        world
            .server
            .register_read_handler(5, move || {
                Ok(Box::new(Cursor::new(data.clone())) as DynReader)
            })
            .unwrap();
    }

    let handshakes: Arc<Mutex<Vec<ChunkType>>> = Arc::default();
    let log = Arc::clone(&handshakes);
    spawn_pump(
        &world,
        Box::new(move |frame| {
            if let Some(chunk) = transfer_chunk(frame) {
                log.lock().push(chunk.chunk_type);
            }
            true
        }),
    );

    let output = SharedVec::default();
    let (tx, rx) = oneshot::channel();
    world
        .client
        .read_with(
            5,
            Box::new(output.clone()) as DynWriter,
            move |status| {
                let _ = tx.send(status);
            },
            ProtocolVersion::Legacy,
            Duration::from_secs(2),
            Duration::from_secs(4),
        )
        .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .expect("transfer must finish")
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(output.contents(), data);

    let handshakes = handshakes.lock();
    assert!(
        !handshakes.contains(&ChunkType::StartAck),
        "legacy sessions skip the versioned handshake"
    );
    assert!(!handshakes.contains(&ChunkType::StartAckConfirmation));
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_transfer_fires_cancelled_once() {
    let world = world(256 + 64, 256);
    let data = resource_bytes(16384);
    {
        let data = data.clone();
        world
            .server
            .register_read_handler(7, move || {
                Ok(Box::new(Cursor::new(data.clone())) as DynReader)
            })
            .unwrap();
    }
    spawn_pump(&world, deliver_all());

    let output = SharedVec::default();
    let completions = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel();
    let handle = {
        let completions = Arc::clone(&completions);
        world
            .client
            .read(7, Box::new(output) as DynWriter, move |status| {
                completions.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(status);
            })
            .unwrap()
    };

    // Let a little of the transfer happen, then cancel.
    tokio::time::sleep(Duration::from_millis(20)).await;
    world.client.cancel_transfer(handle);
    // A second cancel of the same handle is harmless.
    world.client.cancel_transfer(handle);

    let status = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .expect("cancel must surface")
        .unwrap();
    assert_eq!(status, Status::Cancelled);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(completions.load(Ordering::Relaxed), 1);
}
