// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! End-to-end bus transport scenarios over real TCP on localhost.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use atapp::config::GatewayConfig;
use atapp::discovery::DiscoveryNodeInfo;
use atapp::{App, AppConfig, AppEvents, DiscoveryAction, DiscoveryNode, Message, MessageSender};
use atapp_bus::{BusConnector, BusOptions};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Request { from: u64, payload: Vec<u8> },
    Response { to: u64, error_code: i32 },
}

#[derive(Clone, Default)]
struct Recorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl Recorder {
    fn snapshot(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    fn take(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }
}

impl AppEvents for Recorder {
    fn on_forward_request(
        &mut self,
        _app: &mut App,
        source: &MessageSender,
        message: &Message,
    ) -> i32 {
        self.events.borrow_mut().push(Event::Request {
            from: source.id,
            payload: message.payload.clone(),
        });
        0
    }

    fn on_forward_response(
        &mut self,
        _app: &mut App,
        source: &MessageSender,
        _message: &Message,
        error_code: i32,
    ) -> i32 {
        self.events.borrow_mut().push(Event::Response {
            to: source.id,
            error_code,
        });
        0
    }
}

struct TestNode {
    app: App,
    recorder: Recorder,
    bus: Rc<RefCell<BusConnector>>,
}

fn make_node(id: u64, name: &str, options: BusOptions) -> TestNode {
    let mut app = App::new();
    let mut config = AppConfig::default();
    config.id = id.to_string();
    config.name = name.to_string();
    config.type_name = "bussvr".to_string();
    app.setup_configure(config);

    let recorder = Recorder::default();
    app.set_events_observer(Box::new(recorder.clone()));
    let bus = BusConnector::install(&mut app, options);

    TestNode { app, recorder, bus }
}

fn listen_ephemeral(node: &mut TestNode) -> u16 {
    node.app.listen("tcp://127.0.0.1:0").expect("listen");
    node.bus.borrow().bound_addresses()[0].port()
}

fn discovery_for(id: u64, name: &str, port: u16) -> Rc<DiscoveryNode> {
    DiscoveryNode::new(DiscoveryNodeInfo {
        id,
        name: name.to_string(),
        gateways: vec![GatewayConfig {
            address: format!("tcp://127.0.0.1:{port}"),
            ..GatewayConfig::default()
        }],
        ..DiscoveryNodeInfo::default()
    })
}

async fn pump(nodes: &mut [&mut TestNode], rounds: usize, until: impl Fn() -> bool) {
    for _ in 0..rounds {
        for node in nodes.iter_mut() {
            node.app.run_noblock();
        }
        if until() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn forward_request_and_receipt_over_tcp() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut node_a = make_node(1, "node-a", BusOptions::default());
            let mut node_b = make_node(2, "node-b", BusOptions::default());
            let port_b = listen_ephemeral(&mut node_b);

            node_a
                .app
                .handle_discovery_event(DiscoveryAction::Put, &discovery_for(2, "node-b", port_b));

            node_a
                .app
                .send_message_by_id(2, 7, b"hi", None, None)
                .expect("send");

            let b_events = node_b.recorder.clone();
            let a_events = node_a.recorder.clone();
            pump(&mut [&mut node_a, &mut node_b], 400, || {
                !b_events.snapshot().is_empty() && !a_events.snapshot().is_empty()
            })
            .await;

            assert_eq!(
                vec![Event::Request {
                    from: 1,
                    payload: b"hi".to_vec(),
                }],
                node_b.recorder.take()
            );
            let responses = node_a.recorder.take();
            assert!(
                responses
                    .iter()
                    .any(|e| matches!(e, Event::Response { to: 2, error_code: 0 })),
                "expected a delivery receipt, got {responses:?}"
            );
        })
        .await;
}

#[tokio::test]
async fn access_tokens_authenticate_sessions() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let secured = BusOptions {
                access_tokens: vec!["shared-secret".to_string()],
                ..BusOptions::default()
            };
            let mut node_a = make_node(1, "node-a", secured.clone());
            let mut node_b = make_node(2, "node-b", secured);
            let port_b = listen_ephemeral(&mut node_b);

            node_a
                .app
                .handle_discovery_event(DiscoveryAction::Put, &discovery_for(2, "node-b", port_b));
            node_a
                .app
                .send_message_by_id(2, 1, b"authed", None, None)
                .expect("send");

            let b_events = node_b.recorder.clone();
            pump(&mut [&mut node_a, &mut node_b], 400, || {
                !b_events.snapshot().is_empty()
            })
            .await;

            assert_eq!(
                vec![Event::Request {
                    from: 1,
                    payload: b"authed".to_vec(),
                }],
                node_b.recorder.take()
            );
        })
        .await;
}

#[tokio::test]
async fn fallback_direct_send_reuses_inbound_session() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut node_a = make_node(1, "node-a", BusOptions::default());
            let port_a = listen_ephemeral(&mut node_a);
            // node B has no listener and announces nothing to dial back,
            // so A can only answer over the inbound session
            let mut node_b = make_node(2, "node-b", BusOptions::default());

            node_b
                .app
                .handle_discovery_event(DiscoveryAction::Put, &discovery_for(1, "node-a", port_a));
            node_b
                .app
                .send_message_by_id(1, 1, b"ping", None, None)
                .expect("send");

            let a_events = node_a.recorder.clone();
            pump(&mut [&mut node_a, &mut node_b], 400, || {
                !a_events.snapshot().is_empty()
            })
            .await;
            assert_eq!(
                vec![Event::Request {
                    from: 2,
                    payload: b"ping".to_vec(),
                }],
                node_a.recorder.take()
            );

            // A's discovery is empty: the id send must take the fallback
            // path through the session B opened
            node_a
                .app
                .send_message_by_id(2, 1, b"pong", None, None)
                .expect("fallback send");

            let b_events = node_b.recorder.clone();
            pump(&mut [&mut node_a, &mut node_b], 400, || {
                !b_events.snapshot().is_empty()
            })
            .await;
            assert_eq!(
                vec![Event::Request {
                    from: 1,
                    payload: b"pong".to_vec(),
                }],
                node_b.recorder.take()
            );
        })
        .await;
}

#[tokio::test]
async fn command_round_trip() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut node_b = make_node(2, "node-b", BusOptions::default());
            let port_b = listen_ephemeral(&mut node_b);

            let addr = atapp::Address::parse(&format!("tcp://127.0.0.1:{port_b}")).expect("addr");
            let request = tokio::task::spawn_local(async move {
                atapp_bus::command::send_command(
                    &addr,
                    &["ping".to_string()],
                    (9, "cli".to_string()),
                    &[],
                )
                .await
            });

            for _ in 0..400 {
                node_b.app.run_noblock();
                if request.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            let lines = request.await.expect("join").expect("command");
            assert_eq!(vec!["unknown command: ping".to_string()], lines);
        })
        .await;
}
