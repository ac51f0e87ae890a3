//! Transfers between nodes served over real TCP listeners.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_core::{
    ConnectSlotRequest, CreateSlotRequest, DataFrame, Operation, RelayReply, SlotDirection,
    SlotInstance, SlotMedia, SlotRef, SlotSpec, SlotState, SlotStatus, SlotUri,
};
use conduit_reqwest::{ReqwestClient, ReqwestConfig};
use conduit_server::handler::routes;
use conduit_server::service::{RelaySession, ServiceConfig, ServiceState};
use conduit_slots::{RelayAgent, SlotService, SlotsConfig};
use futures::StreamExt;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;

struct Node {
    state: ServiceState,
    base: String,
    client: ReqwestClient,
    _dir: TempDir,
}

/// Starts a node on an ephemeral port that reaches peers with reqwest.
async fn start_node() -> anyhow::Result<Node> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("fs://{}", listener.local_addr()?);
    let dir = tempfile::tempdir()?;

    let client = ReqwestClient::new(ReqwestConfig::default())?;
    let slots = SlotService::builder(SlotsConfig::new(base.clone(), dir.path()))
        .with_transport(Arc::new(client.clone()))
        .with_remote_connector(Arc::new(client.clone()))
        .build()?;
    let state = ServiceState::new(slots, ServiceConfig::default());

    let app = routes().with_state(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });

    Ok(Node {
        state,
        base,
        client,
        _dir: dir,
    })
}

async fn create(
    slots: &SlotService,
    task_id: &str,
    name: &str,
    direction: SlotDirection,
) -> anyhow::Result<SlotStatus> {
    Ok(slots
        .create_slot(CreateSlotRequest {
            task_id: task_id.into(),
            slot: SlotSpec::new(name, SlotMedia::File, direction),
            channel_id: String::new(),
        })
        .await?)
}

async fn produce(
    slots: &SlotService,
    task_id: &str,
    name: &str,
    data: &'static [u8],
) -> anyhow::Result<()> {
    let slot = slots.registry().get(task_id, name)?;
    slot.write(Bytes::from_static(data)).await?;
    slot.close_writer().await?;
    Ok(())
}

/// Connects `t2:/in` on `consumer` to `source` and waits for the transfer.
async fn transfer(consumer: &Node, source: SlotUri) -> anyhow::Result<Vec<u8>> {
    let slots = &consumer.state.slots;
    create(slots, "t2", "/in", SlotDirection::Input).await?;

    let operation = slots.connect_slot(
        ConnectSlotRequest {
            from: SlotRef::new("t2", "/in"),
            to: SlotInstance {
                spec: SlotSpec::new("/out", SlotMedia::File, SlotDirection::Output),
                task_id: "t1".into(),
                channel_id: String::new(),
                uri: source,
            },
            offset: 0,
        },
        None,
    )?;

    let done: Operation = slots
        .await_operation(operation.id, Duration::from_secs(10))
        .await?;
    assert!(done.done);
    assert!(done.error.is_none(), "transfer failed: {:?}", done.error);

    let input = slots.registry().get("t2", "/in")?;
    assert_eq!(input.state(), SlotState::Suspended);
    let path = input
        .local_path()
        .ok_or_else(|| anyhow::anyhow!("input slot has no file"))?;
    Ok(std::fs::read(path)?)
}

#[tokio::test(flavor = "multi_thread")]
async fn input_reads_a_peer_output() -> anyhow::Result<()> {
    let producer = start_node().await?;
    let consumer = start_node().await?;

    create(&producer.state.slots, "t1", "/out", SlotDirection::Output).await?;
    produce(&producer.state.slots, "t1", "/out", b"first line\nsecond line\n").await?;

    let source = SlotUri::parse(&format!("{}/t1/out", producer.base))?;
    let received = transfer(&consumer, source).await?;
    assert_eq!(received, b"first line\nsecond line\n");
    Ok(())
}

/// Serves `terminal` behind `session` over in-process channels.
fn attach_terminal(session: &RelaySession, terminal: Arc<SlotService>) -> anyhow::Result<()> {
    let commands = ReceiverStream::new(session.attach_control()?).map(Ok);
    session.attach_data()?;

    let replies = futures::sink::unfold(session.clone(), |session, reply: RelayReply| async move {
        session.handle_reply(reply);
        Ok::<_, conduit_core::Error>(session)
    });
    let data = futures::sink::unfold(session.clone(), |session, frame: DataFrame| async move {
        session.handle_data(frame).await;
        Ok::<_, conduit_core::Error>(session)
    });

    let agent = RelayAgent::new(terminal);
    tokio::spawn(async move { agent.run(commands, replies, data).await });
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn input_reads_an_output_behind_a_relay() -> anyhow::Result<()> {
    let relay = start_node().await?;
    let consumer = start_node().await?;

    let terminal_dir = tempfile::tempdir()?;
    let terminal = SlotService::builder(SlotsConfig::new("fs://10.9.9.9:9000", terminal_dir.path()))
        .build()?;
    create(&terminal, "t1", "/out", SlotDirection::Output).await?;
    produce(&terminal, "t1", "/out", b"relayed\n").await?;

    let session = relay.state.sessions.create(Some("edge".into()))?;
    attach_terminal(&session, terminal)?;

    let authority = relay.base.trim_start_matches("fs://");
    let source = SlotUri::parse(&format!(
        "relay://{authority}/t1/out?session={}",
        session.id()
    ))?;
    let received = transfer(&consumer, source).await?;
    assert_eq!(received, b"relayed\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_mid_stream_releases_the_peer() -> anyhow::Result<()> {
    let producer = start_node().await?;
    let consumer = start_node().await?;

    let fifo = SlotSpec::new("/fifo", SlotMedia::Pipe, SlotDirection::Output);
    producer
        .state
        .slots
        .create_slot(CreateSlotRequest {
            task_id: "t1".into(),
            slot: fifo.clone(),
            channel_id: String::new(),
        })
        .await?;
    let output = producer.state.slots.registry().get("t1", "/fifo")?;
    let writing = tokio::spawn(async move {
        loop {
            if output.write(Bytes::from_static(b"tick\n")).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let slots = &consumer.state.slots;
    create(slots, "t2", "/in", SlotDirection::Input).await?;
    let operation = slots.connect_slot(
        ConnectSlotRequest {
            from: SlotRef::new("t2", "/in"),
            to: SlotInstance {
                spec: fifo,
                task_id: "t1".into(),
                channel_id: String::new(),
                uri: SlotUri::parse(&format!("{}/t1/fifo", producer.base))?,
            },
            offset: 0,
        },
        None,
    )?;

    let input = slots.registry().get("t2", "/in")?;
    tokio::time::timeout(Duration::from_secs(10), async {
        while input.status().bytes == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert!(!consumer.client.peers().is_empty());

    slots.disconnect_slot(&SlotRef::new("t2", "/in")).await?;
    assert_eq!(input.state(), SlotState::Suspended);

    let done = slots
        .await_operation(operation.id, Duration::from_secs(10))
        .await?;
    assert!(done.done);
    assert!(done.error.is_none(), "disconnect failed the transfer: {:?}", done.error);
    assert!(consumer.client.peers().is_empty());

    let received = input.status().bytes;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(input.status().bytes, received);
    assert_eq!(input.state(), SlotState::Suspended);

    writing.abort();
    Ok(())
}
