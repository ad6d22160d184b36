use embedded_time::duration::Milliseconds;
use newt_msg::{known, Code, ContentFormat, Id, Message, OptValue, Token, Type};

use super::*;
use crate::config::QueueMode;
use crate::dm::Object;
use crate::dm::Registry;
use crate::retry::Attempts;
use crate::test::{ClockMock, SockHandle, SockMock, TestCodec, TestObject};

const SERVER: SocketAddr =
  SocketAddr::V4(no_std_net::SocketAddrV4::new(no_std_net::Ipv4Addr::new(192, 0, 2, 1), 5683));
const BOOTSTRAP: SocketAddr =
  SocketAddr::V4(no_std_net::SocketAddrV4::new(no_std_net::Ipv4Addr::new(192, 0, 2, 2), 5683));

#[derive(Default)]
struct TestApp {
  statuses: Vec<ConnStatus>,
  sends: Vec<(u16, SendResult)>,
  cancelled: Vec<Path>,
  mute: bool,
  codec: Option<TestCodec>,
}

impl App for TestApp {
  fn connection_status_changed(&mut self, status: ConnStatus) {
    self.statuses.push(status);
  }

  fn send_finished(&mut self, id: u16, result: SendResult) {
    self.sends.push((id, result));
  }

  fn observation_cancelled(&mut self, path: Path) {
    self.cancelled.push(path);
  }

  fn mute_send(&mut self) -> bool {
    self.mute
  }

  fn codec(&mut self, format: ContentFormat) -> Option<&mut dyn PayloadCodec> {
    match &mut self.codec {
      | Some(c) if c.format() == format => Some(c),
      | _ => None,
    }
  }
}

fn server_cfg(lifetime_s: u32) -> ServerConfig<'static> {
  ServerConfig { endpoint: "name",
                 server: SERVER,
                 bootstrap_server: Some(BOOTSTRAP),
                 lifetime_s,
                 lwm2m_version: "1.1",
                 initiate_bootstrap: false }
}

fn harness(cfg: Config,
           sc: ServerConfig<'static>,
           mtu: usize)
           -> (Client<'static, SockMock, ClockMock>, SockHandle, ClockMock) {
  simple_logger::SimpleLogger::new().init().ok();
  let (sock, handle) = SockMock::new(mtu);
  let clock = ClockMock::new();
  let client = Client::new(cfg, sc, sock, clock.clone());
  (client, handle, clock)
}

fn step(client: &mut Client<'static, SockMock, ClockMock>,
        objs: &mut [&mut dyn Object],
        app: &mut TestApp) {
  let mut dm = Registry::new(objs);
  client.step(&mut dm, app).unwrap();
}

fn encode(m: &Message) -> Vec<u8> {
  let mut buf = [0u8; 1280];
  let n = m.try_into_bytes(&mut buf).unwrap();
  buf[..n].to_vec()
}

fn decode(bytes: &[u8]) -> Message {
  Message::try_from_bytes(bytes).unwrap()
}

fn reply_created(req: &Message, location: &[&str]) -> Vec<u8> {
  let mut m = Message::new(Type::Ack, Code::CREATED, req.id, req.token);
  for seg in location {
    m.add(known::repeat::LOCATION_PATH,
          OptValue::try_from_slice(seg.as_bytes()).unwrap())
     .unwrap();
  }
  encode(&m)
}

fn reply_code(req: &Message, code: Code) -> Vec<u8> {
  encode(&Message::new(Type::Ack, code, req.id, req.token))
}

/// Drive through a successful registration; yields the Register request
/// the engine sent
fn register(client: &mut Client<'static, SockMock, ClockMock>,
            handle: &SockHandle,
            objs: &mut [&mut dyn Object],
            app: &mut TestApp)
            -> Message {
  step(client, objs, app);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1, "expected exactly the register request");
  let req = decode(&tx[0]);
  assert_eq!(req.code, Code::POST);
  assert_eq!(req.path_segments().collect::<Vec<_>>(), vec!["rd"]);

  handle.push_rx(&reply_created(&req, &["rd", "5a3f"]));
  step(client, objs, app);
  assert_eq!(client.conn_status(), ConnStatus::Registered);
  req
}

#[test]
fn register_carries_endpoint_and_model() {
  let (mut client, handle, _clock) = harness(Config::default(), server_cfg(150), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(0);
  let mut dev = TestObject::new(3);
  dev.add_instance(0);

  step(&mut client, &mut [&mut srv, &mut dev], &mut app);
  let tx = handle.take_tx();
  let req = decode(&tx[0]);

  let queries: Vec<&str> = req.queries().collect();
  assert!(queries.contains(&"ep=name"));
  assert!(queries.contains(&"lt=150"));
  assert!(queries.contains(&"lwm2m=1.1"));
  assert!(queries.contains(&"b=U"));
  assert_eq!(req.content_format(), Some(ContentFormat::LinkFormat));
  assert_eq!(core::str::from_utf8(req.payload.as_bytes()).unwrap(),
             "</1/0>,</3/0>");
  assert_eq!(client.conn_status(), ConnStatus::Registering);
}

#[test]
fn register_update_lifetime_change() {
  let (mut client, handle, clock) = harness(Config::default(), server_cfg(150), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(0);
  let mut dev = TestObject::new(3);
  dev.add_instance(0);

  register(&mut client,
           &handle,
           &mut [&mut srv, &mut dev],
           &mut app);
  assert!(app.statuses.contains(&ConnStatus::Registered));

  // lifetime change triggers an Update to the assigned location with
  // the new lt and no payload
  client.lifetime_changed(100);
  step(&mut client, &mut [&mut srv, &mut dev], &mut app);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let update = decode(&tx[0]);
  assert_eq!(update.code, Code::POST);
  assert_eq!(update.path_segments().collect::<Vec<_>>(), vec!["rd", "5a3f"]);
  assert_eq!(update.queries().collect::<Vec<_>>(), vec!["lt=100"]);
  assert!(update.payload.as_bytes().is_empty());

  handle.push_rx(&reply_code(&update, Code::CHANGED));
  step(&mut client, &mut [&mut srv, &mut dev], &mut app);

  // 100 s < 2 × MAX_TRANSMIT_WAIT, so the refresh fires at half the
  // lifetime after the successful update
  clock.set(49_999);
  step(&mut client, &mut [&mut srv, &mut dev], &mut app);
  assert!(handle.take_tx().is_empty());

  clock.set(50_000);
  step(&mut client, &mut [&mut srv, &mut dev], &mut app);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let refresh = decode(&tx[0]);
  assert_eq!(refresh.path_segments().collect::<Vec<_>>(), vec!["rd", "5a3f"]);
  assert!(refresh.queries().next().is_none());
  assert!(refresh.payload.as_bytes().is_empty());
}

#[test]
fn retransmitted_read_replays_identical_response() {
  let (mut client, handle, _clock) = harness(Config::default(), server_cfg(3600), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(0);
  let mut dev = TestObject::new(3);
  dev.add_instance(0);
  dev.set_text(Path::resource(3, 0, 2), "53r141-number");

  register(&mut client,
           &handle,
           &mut [&mut srv, &mut dev],
           &mut app);

  let mut read = Message::new(Type::Con,
                              Code::GET,
                              Id(0x77),
                              Token::from_bytes(&[9, 9]));
  read.set_path("3/0/2").unwrap();
  let read_bytes = encode(&read);

  handle.push_rx(&read_bytes);
  step(&mut client, &mut [&mut srv, &mut dev], &mut app);
  let first = handle.take_tx();
  assert_eq!(first.len(), 1);
  let resp = decode(&first[0]);
  assert_eq!(resp.code, Code::CONTENT);
  assert_eq!(resp.token, read.token);
  assert_eq!(resp.payload.as_bytes(), b"53r141-number");

  // the retransmission gets the cached bytes, verbatim
  handle.push_rx(&read_bytes);
  step(&mut client, &mut [&mut srv, &mut dev], &mut app);
  let second = handle.take_tx();
  assert_eq!(second.len(), 1);
  assert_eq!(second[0], first[0]);
}

#[test]
fn blockwise_update_after_objects_added() {
  // 192-byte MTU → 64-byte blocks
  let (mut client, handle, _clock) = harness(Config::default(), server_cfg(3600), 192);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(0);
  let mut dev = TestObject::new(3);
  dev.add_instance(0);

  register(&mut client,
           &handle,
           &mut [&mut srv, &mut dev],
           &mut app);

  // seven objects the server has not seen make the link payload
  // outgrow one block
  let mut extra: Vec<TestObject> = (9900u16..=9906).map(TestObject::new).collect();
  for o in extra.iter_mut() {
    o.add_instance(0);
  }

  {
    let mut objs: Vec<&mut dyn Object> = Vec::new();
    objs.push(&mut srv);
    objs.push(&mut dev);
    for o in extra.iter_mut() {
      objs.push(o);
    }
    let mut dm = Registry::new(&mut objs);
    client.data_model_changed(&mut dm, Path::object(9900));
    client.step(&mut dm, &mut app).unwrap();
  }

  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let block0 = decode(&tx[0]);
  let b1 = block0.block1().expect("expected a Block1 update");
  assert_eq!((b1.size(), b1.num(), b1.more()), (64, 0, true));
  assert_eq!(block0.payload.as_bytes().len(), 64);
  assert_eq!(block0.content_format(), Some(ContentFormat::LinkFormat));

  let mut cont = Message::new(Type::Ack, Code::CONTINUE, block0.id, block0.token);
  cont.set_block1(64, 0, true).unwrap();
  handle.push_rx(&encode(&cont));

  {
    let mut objs: Vec<&mut dyn Object> = Vec::new();
    objs.push(&mut srv);
    objs.push(&mut dev);
    for o in extra.iter_mut() {
      objs.push(o);
    }
    let mut dm = Registry::new(&mut objs);
    client.step(&mut dm, &mut app).unwrap();
  }

  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let block1_msg = decode(&tx[0]);
  let b1 = block1_msg.block1().unwrap();
  assert_eq!(b1.num(), 1);
  assert_eq!(b1.more(), false);
  assert_eq!(block1_msg.token, block0.token);

  let mut done = Message::new(Type::Ack, Code::CHANGED, block1_msg.id, block1_msg.token);
  done.set_block1(64, 1, false).unwrap();
  handle.push_rx(&encode(&done));

  {
    let mut objs: Vec<&mut dyn Object> = Vec::new();
    objs.push(&mut srv);
    objs.push(&mut dev);
    for o in extra.iter_mut() {
      objs.push(o);
    }
    let mut dm = Registry::new(&mut objs);
    client.step(&mut dm, &mut app).unwrap();
  }
  assert_eq!(client.conn_status(), ConnStatus::Registered);
}

#[test]
fn queue_mode_entry_and_exit() {
  let mut cfg = Config::default();
  cfg.registration.queue_mode = Some(QueueMode { timeout: Milliseconds(50_000) });

  let (mut client, handle, clock) = harness(cfg, server_cfg(150), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(0);

  let req = {
    step(&mut client, &mut [&mut srv], &mut app);
    let tx = handle.take_tx();
    let req = decode(&tx[0]);
    assert!(req.queries().any(|q| q == "Q"));
    handle.push_rx(&reply_created(&req, &["rd", "1"]));
    step(&mut client, &mut [&mut srv], &mut app);
    req
  };
  let _ = req;
  assert_eq!(client.conn_status(), ConnStatus::Registered);

  // no traffic: socket closes at exactly last_activity + 50 s
  clock.set(49_999);
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(handle.closes.get(), 0);

  clock.set(50_000);
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(handle.closes.get(), 1);
  assert_eq!(client.conn_status(), ConnStatus::QueueMode);

  // at half the lifetime the refresh comes due, which reopens the
  // connection with the previous local port
  clock.set(75_000);
  step(&mut client, &mut [&mut srv], &mut app);
  assert!(handle.reuses.get() >= 1);
  assert_eq!(client.conn_status(), ConnStatus::Registered);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  assert_eq!(decode(&tx[0]).path_segments().collect::<Vec<_>>(),
             vec!["rd", "1"]);
}

#[test]
fn observation_pmin_defers_and_pmax_refires() {
  let (mut client, handle, clock) = harness(Config::default(), server_cfg(4000), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(1);
  srv.set(Path::resource_instance(1, 1, 5, 0), 1);

  register(&mut client, &handle, &mut [&mut srv], &mut app);

  // write-attributes: pmin=100, pmax=300
  let mut wa = Message::new(Type::Con, Code::PUT, Id(0x10), Token::from_bytes(&[1]));
  wa.set_path("1/1/5").unwrap();
  wa.add_query("pmin=100").unwrap();
  wa.add_query("pmax=300").unwrap();
  handle.push_rx(&encode(&wa));
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(decode(&handle.take_tx()[0]).code, Code::CHANGED);

  // observe
  let obs_token = Token::from_bytes(&[0xAB]);
  let mut obs = Message::new(Type::Con, Code::GET, Id(0x11), obs_token);
  obs.set_path("1/1/5").unwrap();
  obs.set_observe(0).unwrap();
  handle.push_rx(&encode(&obs));
  step(&mut client, &mut [&mut srv], &mut app);
  let initial = decode(&handle.take_tx()[0]);
  assert_eq!(initial.code, Code::CONTENT);
  assert_eq!(initial.observe(), Some(0));

  // a change at t=60 s is deferred by pmin
  clock.set(60_000);
  srv.set(Path::resource_instance(1, 1, 5, 0), 2);
  {
    let mut objs: [&mut dyn Object; 1] = [&mut srv];
    let mut dm = Registry::new(&mut objs);
    client.data_model_changed(&mut dm, Path::resource_instance(1, 1, 5, 0));
  }
  step(&mut client, &mut [&mut srv], &mut app);
  assert!(handle.take_tx().is_empty());

  // pmin opens at t=100 s (measured from the initial observe at t=0)
  clock.set(101_000);
  step(&mut client, &mut [&mut srv], &mut app);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let notify1 = decode(&tx[0]);
  assert_eq!(notify1.ty, Type::Non);
  assert_eq!(notify1.token, obs_token);
  assert_eq!(notify1.observe(), Some(1));
  assert_eq!(notify1.payload.as_bytes(), b"2");

  // no further change: pmax forces the next one, sequence bumped by one
  clock.set(400_999);
  step(&mut client, &mut [&mut srv], &mut app);
  assert!(handle.take_tx().is_empty());

  clock.set(401_000);
  step(&mut client, &mut [&mut srv], &mut app);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let notify2 = decode(&tx[0]);
  assert_eq!(notify2.observe(), Some(2));
}

#[test]
fn registration_exhaustion_falls_back_to_bootstrap() {
  let mut cfg = Config::default();
  cfg.registration.retry = crate::config::RetryPolicy { retry_count: Attempts(1),
                                                        retry_timer: Milliseconds(1_000),
                                                        seq_retry_count: Attempts(1),
                                                        seq_delay_timer:
                                                          Milliseconds(60_000) };

  let (mut client, handle, _clock) = harness(cfg, server_cfg(300), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(0);

  step(&mut client, &mut [&mut srv], &mut app);
  let req = decode(&handle.take_tx()[0]);

  handle.push_rx(&reply_code(&req, Code::BAD_REQUEST));
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(client.conn_status(), ConnStatus::Bootstrapping);

  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let bs = decode(&tx[0]);
  assert_eq!(bs.code, Code::POST);
  assert_eq!(bs.path_segments().collect::<Vec<_>>(), vec!["bs"]);
  assert!(bs.queries().any(|q| q == "ep=name"));
}

#[test]
fn bootstrap_write_then_finish_leads_to_register() {
  let sc = ServerConfig { initiate_bootstrap: true,
                          ..server_cfg(300) };
  let (mut client, handle, _clock) = harness(Config::default(), sc, 1280);
  let mut app = TestApp::default();
  let mut sec = TestObject::new(0);
  let mut srv = TestObject::new(1);
  srv.add_instance(0);

  step(&mut client, &mut [&mut sec, &mut srv], &mut app);
  assert_eq!(client.conn_status(), ConnStatus::Bootstrapping);
  let bs_req = decode(&handle.take_tx()[0]);
  assert_eq!(bs_req.path_segments().collect::<Vec<_>>(), vec!["bs"]);

  handle.push_rx(&reply_code(&bs_req, Code::CHANGED));
  step(&mut client, &mut [&mut sec, &mut srv], &mut app);

  // the bootstrap server writes a Security instance that does not
  // exist yet; the bootstrap write scope creates it
  let mut write = Message::new(Type::Con, Code::PUT, Id(0x20), Token::from_bytes(&[5]));
  write.set_path("0/1/1").unwrap();
  write.payload = newt_msg::Payload::try_from_slice(b"17").unwrap();
  handle.push_rx(&encode(&write));
  step(&mut client, &mut [&mut sec, &mut srv], &mut app);
  assert_eq!(decode(&handle.take_tx()[0]).code, Code::CHANGED);
  assert_eq!(sec.read_int(Path::resource(0, 1, 1)), Some(17));

  // Bootstrap-Finish moves the machine on to registration
  let mut finish = Message::new(Type::Con, Code::POST, Id(0x21), Token::from_bytes(&[6]));
  finish.set_path("bs").unwrap();
  handle.push_rx(&encode(&finish));
  step(&mut client, &mut [&mut sec, &mut srv], &mut app);

  let tx = handle.take_tx();
  let finish_resp = decode(&tx[0]);
  assert_eq!(finish_resp.code, Code::CHANGED);
  assert_eq!(client.conn_status(), ConnStatus::Registering);

  // and a register request goes to the management server
  let reg_req = tx.iter()
                  .map(|b| decode(b))
                  .find(|m| m.path_segments().next() == Some("rd"));
  assert!(reg_req.is_some(), "register should follow bootstrap");
}

#[test]
fn server_write_and_execute() {
  let (mut client, handle, _clock) = harness(Config::default(), server_cfg(3600), 1280);
  let mut app = TestApp::default();
  let mut dev = TestObject::new(3);
  dev.add_instance(0);

  register(&mut client, &handle, &mut [&mut dev], &mut app);

  let mut put = Message::new(Type::Con, Code::PUT, Id(0x30), Token::from_bytes(&[1]));
  put.set_path("3/0/1").unwrap();
  put.set_content_format(ContentFormat::Text).unwrap();
  put.payload = newt_msg::Payload::try_from_slice(b"42").unwrap();
  handle.push_rx(&encode(&put));
  step(&mut client, &mut [&mut dev], &mut app);
  assert_eq!(decode(&handle.take_tx()[0]).code, Code::CHANGED);
  assert_eq!(dev.read_int(Path::resource(3, 0, 1)), Some(42));

  let mut exec = Message::new(Type::Con, Code::POST, Id(0x31), Token::from_bytes(&[2]));
  exec.set_path("3/0/8").unwrap();
  exec.payload = newt_msg::Payload::try_from_slice(b"go").unwrap();
  handle.push_rx(&encode(&exec));
  step(&mut client, &mut [&mut dev], &mut app);
  assert_eq!(decode(&handle.take_tx()[0]).code, Code::CHANGED);
  assert_eq!(dev.executed, vec![(0, 8, b"go".to_vec())]);

  let mut del = Message::new(Type::Con, Code::DELETE, Id(0x32), Token::from_bytes(&[3]));
  del.set_path("3/0").unwrap();
  handle.push_rx(&encode(&del));
  step(&mut client, &mut [&mut dev], &mut app);
  assert_eq!(decode(&handle.take_tx()[0]).code, Code::DELETED);
  assert!(dev.instances.is_empty());
}

#[test]
fn discover_lists_structure_with_attributes() {
  let (mut client, handle, _clock) = harness(Config::default(), server_cfg(3600), 1280);
  let mut app = TestApp::default();
  let mut dev = TestObject::new(3);
  dev.add_instance(0);

  register(&mut client, &handle, &mut [&mut dev], &mut app);

  let mut wa = Message::new(Type::Con, Code::PUT, Id(0x40), Token::from_bytes(&[1]));
  wa.set_path("3/0/1").unwrap();
  wa.add_query("pmin=10").unwrap();
  handle.push_rx(&encode(&wa));
  step(&mut client, &mut [&mut dev], &mut app);
  handle.take_tx();

  let mut disc = Message::new(Type::Con, Code::GET, Id(0x41), Token::from_bytes(&[2]));
  disc.set_path("3/0").unwrap();
  disc.set_accept(ContentFormat::LinkFormat).unwrap();
  handle.push_rx(&encode(&disc));
  step(&mut client, &mut [&mut dev], &mut app);

  let resp = decode(&handle.take_tx()[0]);
  assert_eq!(resp.code, Code::CONTENT);
  assert_eq!(resp.content_format(), Some(ContentFormat::LinkFormat));
  let body = core::str::from_utf8(resp.payload.as_bytes()).unwrap();
  assert!(body.contains("</3/0>"));
  assert!(body.contains("</3/0/1>;pmin=10"));
}

#[test]
fn unknown_critical_option_is_bad_option() {
  let (mut client, handle, _clock) = harness(Config::default(), server_cfg(3600), 1280);
  let mut app = TestApp::default();
  let mut dev = TestObject::new(3);
  dev.add_instance(0);

  register(&mut client, &handle, &mut [&mut dev], &mut app);

  let mut req = Message::new(Type::Con, Code::GET, Id(0x50), Token::from_bytes(&[1]));
  req.set_path("3/0/1").unwrap();
  // If-Match (1) is critical and not handled by this engine
  req.add(newt_msg::known::repeat::IF_MATCH,
          OptValue::try_from_slice(b"etag").unwrap())
     .unwrap();
  handle.push_rx(&encode(&req));
  step(&mut client, &mut [&mut dev], &mut app);

  assert_eq!(decode(&handle.take_tx()[0]).code, Code::BAD_OPTION);
}

#[test]
fn disable_deregisters_and_suspends() {
  let (mut client, handle, clock) = harness(Config::default(), server_cfg(3600), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(0);

  register(&mut client, &handle, &mut [&mut srv], &mut app);

  client.server_obj_disable_executed(30);
  step(&mut client, &mut [&mut srv], &mut app);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let dereg = decode(&tx[0]);
  assert_eq!(dereg.code, Code::DELETE);
  assert_eq!(dereg.path_segments().collect::<Vec<_>>(), vec!["rd", "5a3f"]);

  handle.push_rx(&reply_code(&dereg, Code::DELETED));
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(client.conn_status(), ConnStatus::Suspended);

  // suspension ends after 30 s and a fresh register goes out
  clock.set(30_000);
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(client.conn_status(), ConnStatus::Registering);
  let tx = handle.take_tx();
  assert!(!tx.is_empty());
  assert_eq!(decode(&tx[0]).path_segments().collect::<Vec<_>>(),
             vec!["rd"]);
}

#[test]
fn send_waits_for_codec_and_reports() {
  let (mut client, handle, _clock) = harness(Config::default(), server_cfg(3600), 1280);
  let mut app = TestApp::default();
  let mut dev = TestObject::new(3);
  dev.add_instance(0);
  dev.set(Path::resource(3, 0, 1), 7);

  // not registered yet: Send is not allowed
  assert_eq!(client.send(&mut app, &[Path::resource(3, 0, 1)], ContentFormat::SenmlCbor),
             Err(Error::NotAllowed));

  register(&mut client, &handle, &mut [&mut dev], &mut app);

  let id = client.send(&mut app, &[Path::resource(3, 0, 1)], ContentFormat::SenmlCbor)
                 .unwrap();

  // no SenML codec is installed in this host: completion is Internal
  step(&mut client, &mut [&mut dev], &mut app);
  assert_eq!(app.sends, vec![(id, SendResult::Internal)]);

  // a muted client refuses at the door
  app.mute = true;
  assert_eq!(client.send(&mut app, &[Path::resource(3, 0, 1)], ContentFormat::SenmlCbor),
             Err(Error::NotAllowed));
}

#[test]
fn observe_composite_paces_with_epmin_epmax() {
  let (mut client, handle, clock) = harness(Config::default(), server_cfg(4000), 1280);
  let mut app = TestApp { codec: Some(TestCodec),
                          ..Default::default() };
  let mut srv = TestObject::new(1);
  srv.add_instance(1);
  srv.set(Path::resource(1, 1, 1), 1);
  srv.set(Path::resource(1, 1, 2), 2);

  register(&mut client, &handle, &mut [&mut srv], &mut app);

  // instance-level attributes bound the composite evaluation window
  let mut wa = Message::new(Type::Con, Code::PUT, Id(0x70), Token::from_bytes(&[1]));
  wa.set_path("1/1").unwrap();
  wa.add_query("epmin=50").unwrap();
  wa.add_query("epmax=200").unwrap();
  handle.push_rx(&encode(&wa));
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(decode(&handle.take_tx()[0]).code, Code::CHANGED);

  // FETCH + Observe registers a composite observation over both paths
  let obs_token = Token::from_bytes(&[0xCC]);
  let mut obs = Message::new(Type::Con, Code::FETCH, Id(0x71), obs_token);
  obs.set_observe(0).unwrap();
  obs.set_content_format(ContentFormat::SenmlCbor).unwrap();
  obs.set_accept(ContentFormat::SenmlCbor).unwrap();
  obs.payload = newt_msg::Payload::try_from_slice(b"/1/1/1;/1/1/2").unwrap();
  handle.push_rx(&encode(&obs));
  step(&mut client, &mut [&mut srv], &mut app);

  let initial = decode(&handle.take_tx()[0]);
  assert_eq!(initial.code, Code::CONTENT);
  assert_eq!(initial.observe(), Some(0));
  assert_eq!(initial.content_format(), Some(ContentFormat::SenmlCbor));
  assert_eq!(initial.payload.as_bytes(), b"/1/1/1=1;/1/1/2=2;");

  // a member change at t=10 s is deferred by epmin
  clock.set(10_000);
  srv.set(Path::resource(1, 1, 1), 9);
  {
    let mut objs: [&mut dyn Object; 1] = [&mut srv];
    let mut dm = Registry::new(&mut objs);
    client.data_model_changed(&mut dm, Path::resource(1, 1, 1));
  }
  step(&mut client, &mut [&mut srv], &mut app);
  assert!(handle.take_tx().is_empty());

  clock.set(50_000);
  step(&mut client, &mut [&mut srv], &mut app);
  let tx = handle.take_tx();
  assert_eq!(tx.len(), 1);
  let notify1 = decode(&tx[0]);
  assert_eq!(notify1.ty, Type::Non);
  assert_eq!(notify1.token, obs_token);
  assert_eq!(notify1.observe(), Some(1));
  assert_eq!(notify1.payload.as_bytes(), b"/1/1/1=9;/1/1/2=2;");

  // no further change: epmax forces the next one by t=250 s
  clock.set(249_999);
  step(&mut client, &mut [&mut srv], &mut app);
  assert!(handle.take_tx().is_empty());

  clock.set(250_000);
  step(&mut client, &mut [&mut srv], &mut app);
  let notify2 = decode(&handle.take_tx()[0]);
  assert_eq!(notify2.observe(), Some(2));

  // FETCH + Observe=1 cancels; later changes stay quiet
  let mut cancel = Message::new(Type::Con, Code::FETCH, Id(0x72), obs_token);
  cancel.set_observe(1).unwrap();
  cancel.set_content_format(ContentFormat::SenmlCbor).unwrap();
  cancel.payload = newt_msg::Payload::try_from_slice(b"/1/1/1;/1/1/2").unwrap();
  handle.push_rx(&encode(&cancel));
  step(&mut client, &mut [&mut srv], &mut app);
  assert_eq!(decode(&handle.take_tx()[0]).code, Code::CONTENT);

  clock.set(600_000);
  srv.set(Path::resource(1, 1, 1), 77);
  {
    let mut objs: [&mut dyn Object; 1] = [&mut srv];
    let mut dm = Registry::new(&mut objs);
    client.data_model_changed(&mut dm, Path::resource(1, 1, 1));
  }
  step(&mut client, &mut [&mut srv], &mut app);
  assert!(handle.take_tx().is_empty());
}

#[test]
fn next_step_time_tracks_observation_deadlines() {
  let (mut client, handle, clock) = harness(Config::default(), server_cfg(4000), 1280);
  let mut app = TestApp::default();
  let mut srv = TestObject::new(1);
  srv.add_instance(1);
  srv.set(Path::resource_instance(1, 1, 5, 0), 1);

  register(&mut client, &handle, &mut [&mut srv], &mut app);

  let mut wa = Message::new(Type::Con, Code::PUT, Id(0x60), Token::from_bytes(&[1]));
  wa.set_path("1/1/5").unwrap();
  wa.add_query("pmax=300").unwrap();
  handle.push_rx(&encode(&wa));
  step(&mut client, &mut [&mut srv], &mut app);
  handle.take_tx();

  let mut obs = Message::new(Type::Con, Code::GET, Id(0x61), Token::from_bytes(&[2]));
  obs.set_path("1/1/5").unwrap();
  obs.set_observe(0).unwrap();
  handle.push_rx(&encode(&obs));
  step(&mut client, &mut [&mut srv], &mut app);
  handle.take_tx();

  clock.set(100_000);
  // pmax deadline is 300 s after the observe snapshot
  let wait = client.next_step_time().unwrap();
  assert!(wait <= Milliseconds(200_000u64), "wait was {:?}", wait);
}
