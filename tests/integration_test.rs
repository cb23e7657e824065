use energy_meter_gateway::{
    poll::PollTiming,
    register_codec::encode_float32,
    Acquisition, AcquisitionConfig, BroadcastHub, BusEndpoint, DeviceRegisterMap, LinkState,
    MeterField, ModbusTransport, RegisterMapRegistry, SqliteSink, WordOrder,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_modbus::{
    prelude::*,
    server::{
        tcp::{accept_tcp_connection, Server},
        Service,
    },
};

/// Mock TEM015XP meters behind a Modbus TCP gateway
#[derive(Clone)]
struct MockMeterServer {
    registers: Arc<Mutex<HashMap<(u8, u16), u16>>>,
    reply_delays: Arc<Mutex<HashMap<u8, Duration>>>,
    read_count: Arc<AtomicU32>,
}

impl MockMeterServer {
    fn new() -> Self {
        Self {
            registers: Arc::new(Mutex::new(HashMap::new())),
            reply_delays: Arc::new(Mutex::new(HashMap::new())),
            read_count: Arc::new(AtomicU32::new(0)),
        }
    }

    fn set_value(&self, slave_id: u8, field: MeterField, value: f32) {
        let map = DeviceRegisterMap::tem015xp(slave_id, WordOrder::BigEndianWords);
        let address = map.address_of(field).unwrap();
        let (a, b) = encode_float32(value, WordOrder::BigEndianWords);
        let mut registers = self.registers.lock().unwrap();
        registers.insert((slave_id, address), a);
        registers.insert((slave_id, address + 1), b);
    }

    fn load_meter(&self, slave_id: u8, voltage: f32, active_power: f32, energy: f32) {
        self.set_value(slave_id, MeterField::Voltage, voltage);
        self.set_value(slave_id, MeterField::Current, active_power / voltage);
        self.set_value(slave_id, MeterField::ActivePower, active_power);
        self.set_value(slave_id, MeterField::ApparentPower, active_power);
        self.set_value(slave_id, MeterField::ReactivePower, 0.0);
        self.set_value(slave_id, MeterField::PowerFactor, 1.0);
        self.set_value(slave_id, MeterField::Frequency, 50.0);
        self.set_value(slave_id, MeterField::ImportActiveEnergy, energy);
        self.set_value(slave_id, MeterField::ExportActiveEnergy, 0.0);
        self.set_value(slave_id, MeterField::ImportReactiveEnergy, 0.0);
        self.set_value(slave_id, MeterField::ExportReactiveEnergy, 0.0);
    }

    /// Holds every reply from `slave_id` back by `delay`
    fn delay_replies(&self, slave_id: u8, delay: Duration) {
        self.reply_delays.lock().unwrap().insert(slave_id, delay);
    }

    fn get_read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
}

impl Service for MockMeterServer {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Exception>> + Send>,
    >;

    fn call(&self, req: Self::Request) -> Self::Future {
        let registers = self.registers.clone();
        let read_count = self.read_count.clone();
        let delay = self.reply_delays.lock().unwrap().get(&req.slave).copied();

        Box::pin(async move {
            read_count.fetch_add(1, Ordering::Relaxed);
            let slave_id = req.slave;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            match req.request {
                Request::ReadInputRegisters(addr, cnt) => {
                    let registers = registers.lock().unwrap();
                    if !registers.keys().any(|(slave, _)| *slave == slave_id) {
                        return Err(ExceptionCode::GatewayTargetDevice);
                    }
                    if u32::from(addr) + u32::from(cnt) > 44 {
                        return Err(ExceptionCode::IllegalDataAddress);
                    }
                    Ok(Response::ReadInputRegisters(
                        (addr..addr + cnt)
                            .map(|a| registers.get(&(slave_id, a)).copied().unwrap_or(0))
                            .collect(),
                    ))
                }
                _ => Err(ExceptionCode::IllegalFunction),
            }
        })
    }
}

/// Start mock meter gateway
async fn start_mock_meter_server() -> (MockMeterServer, SocketAddr, oneshot::Sender<()>) {
    let mock_server = MockMeterServer::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server_clone = mock_server.clone();

    tokio::spawn(async move {
        let server = Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(server_clone.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            eprintln!("Mock meter server error: {}", err);
        };

        tokio::select! {
            _ = server.serve(&on_connected, on_process_error) => {},
            _ = shutdown_rx => {
                println!("Mock meter server shutting down");
            }
        }
    });

    (mock_server, addr, shutdown_tx)
}

fn test_config(max_retries: u32) -> AcquisitionConfig {
    AcquisitionConfig {
        poll_interval: Duration::from_secs(60),
        timing: PollTiming::immediate(),
        max_retries,
        retry_delay: Duration::from_millis(50),
    }
}

fn subscribe(hub: &BroadcastHub) -> mpsc::Receiver<Arc<str>> {
    let (tx, mut rx) = mpsc::channel(64);
    hub.subscribe(tx).unwrap();
    let greeting: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
    assert_eq!(greeting["type"], "connection_status");
    rx
}

async fn next_event(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
    let payload = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timeout waiting for hub event")
        .expect("Hub dropped the subscriber");
    serde_json::from_str(&payload).unwrap()
}

#[tokio::test]
async fn test_readings_flow_from_bus_to_store_and_subscribers() {
    let (mock_meter, meter_addr, _shutdown) = start_mock_meter_server().await;
    mock_meter.load_meter(5, 231.4, 1500.0, 1234.5);
    mock_meter.load_meter(2, 229.8, 250.0, 87.25);

    let registry = RegisterMapRegistry::from_slave_ids(&[5, 2], WordOrder::BigEndianWords).unwrap();
    let sink = Arc::new(SqliteSink::in_memory().await.unwrap());
    let hub = Arc::new(BroadcastHub::new());
    let mut rx = subscribe(&hub);

    let transport = ModbusTransport::new(BusEndpoint::Tcp(meter_addr), Duration::from_secs(1));
    let acquisition = Acquisition::spawn(transport, registry, sink.clone(), hub.clone(), test_config(3));

    let status = next_event(&mut rx).await;
    assert_eq!(status["type"], "modbus_status");
    assert_eq!(status["connected"], true);
    assert_eq!(status["message"], "Modbus connected successfully");

    let first = next_event(&mut rx).await;
    assert_eq!(first["type"], "energy_reading");
    assert_eq!(first["deviceId"], "TEM015XP_5");
    assert_eq!(first["success"], true);
    assert_eq!(first["voltage"], 231.4);
    assert_eq!(first["active_power"], 1500.0);
    assert_eq!(first["energy_total"], 1234.5);

    let second = next_event(&mut rx).await;
    assert_eq!(second["deviceId"], "TEM015XP_2");
    assert_eq!(second["voltage"], 229.8);
    assert_eq!(second["import_active_energy"], 87.25);

    println!("✅ Test 1 passed: readings decoded and broadcast in poll order");

    let rows: Vec<(String, Option<f64>)> =
        sqlx::query_as("SELECT device_id, active_power FROM energy_readings ORDER BY id")
            .fetch_all(sink.pool())
            .await
            .unwrap();
    assert_eq!(
        rows,
        vec![
            ("TEM015XP_5".to_string(), Some(1500.0)),
            ("TEM015XP_2".to_string(), Some(250.0)),
        ]
    );
    assert_eq!(mock_meter.get_read_count(), 22);
    assert_eq!(acquisition.status().state, LinkState::Connected);

    println!("✅ Test 2 passed: readings persisted, one request per field");

    acquisition.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_meter_does_not_block_the_next_one() {
    let (mock_meter, meter_addr, _shutdown) = start_mock_meter_server().await;
    // slave 9 is not behind the gateway
    mock_meter.load_meter(2, 230.0, 100.0, 1.0);

    let registry = RegisterMapRegistry::from_slave_ids(&[9, 2], WordOrder::BigEndianWords).unwrap();
    let sink = Arc::new(SqliteSink::in_memory().await.unwrap());
    let hub = Arc::new(BroadcastHub::new());
    let mut rx = subscribe(&hub);

    let transport = ModbusTransport::new(BusEndpoint::Tcp(meter_addr), Duration::from_secs(1));
    let acquisition = Acquisition::spawn(transport, registry, sink.clone(), hub.clone(), test_config(3));

    assert_eq!(next_event(&mut rx).await["connected"], true);

    let failed = next_event(&mut rx).await;
    assert_eq!(failed["deviceId"], "TEM015XP_9");
    assert_eq!(failed["success"], false);
    assert!(failed["error"].as_str().unwrap().contains("voltage"));

    let ok = next_event(&mut rx).await;
    assert_eq!(ok["deviceId"], "TEM015XP_2");
    assert_eq!(ok["success"], true);

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM energy_readings")
        .fetch_one(sink.pool())
        .await
        .unwrap();
    assert_eq!(stored, 1);
    assert_eq!(acquisition.status().state, LinkState::Connected);

    acquisition.shutdown().await;
}

#[tokio::test]
async fn test_late_reply_does_not_break_the_next_meter() {
    let (mock_meter, meter_addr, _shutdown) = start_mock_meter_server().await;
    mock_meter.load_meter(9, 230.0, 500.0, 10.0);
    mock_meter.load_meter(2, 229.5, 100.0, 1.0);
    // slave 9 answers, but only after the read timeout has expired
    mock_meter.delay_replies(9, Duration::from_millis(1500));

    let registry = RegisterMapRegistry::from_slave_ids(&[9, 2], WordOrder::BigEndianWords).unwrap();
    let sink = Arc::new(SqliteSink::in_memory().await.unwrap());
    let hub = Arc::new(BroadcastHub::new());
    let mut rx = subscribe(&hub);

    let transport = ModbusTransport::new(BusEndpoint::Tcp(meter_addr), Duration::from_secs(1));
    let acquisition = Acquisition::spawn(transport, registry, sink.clone(), hub.clone(), test_config(3));

    assert_eq!(next_event(&mut rx).await["connected"], true);

    let late = next_event(&mut rx).await;
    assert_eq!(late["deviceId"], "TEM015XP_9");
    assert_eq!(late["success"], false);
    assert!(late["error"].as_str().unwrap().contains("no response"));

    let ok = next_event(&mut rx).await;
    assert_eq!(ok["type"], "energy_reading");
    assert_eq!(ok["deviceId"], "TEM015XP_2");
    assert_eq!(ok["success"], true);
    assert_eq!(ok["voltage"], 229.5);

    // the late frame must not surface as a lost link
    assert!(timeout(Duration::from_millis(700), rx.recv()).await.is_err());
    assert_eq!(acquisition.status().state, LinkState::Connected);
    assert!(hub.modbus_connected());

    acquisition.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_bus_ends_disabled() {
    // grab a free port, then close it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let registry = RegisterMapRegistry::from_slave_ids(&[5], WordOrder::BigEndianWords).unwrap();
    let sink = Arc::new(SqliteSink::in_memory().await.unwrap());
    let hub = Arc::new(BroadcastHub::new());
    let mut rx = subscribe(&hub);

    let transport = ModbusTransport::new(BusEndpoint::Tcp(dead_addr), Duration::from_secs(1));
    let acquisition = Acquisition::spawn(transport, registry, sink, hub.clone(), test_config(2));

    for attempt in 1..=2 {
        let event = next_event(&mut rx).await;
        assert_eq!(event["type"], "modbus_status");
        assert_eq!(event["connected"], false);
        assert_eq!(
            event["message"],
            format!("Modbus disconnected. Retry attempt {attempt}/2")
        );
    }

    let mut status = acquisition.control().subscribe_status();
    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.state == LinkState::Disabled),
    )
    .await
    .expect("Timeout waiting for Disabled")
    .unwrap();

    // nothing more arrives once disabled
    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    assert!(!hub.modbus_connected());

    acquisition.shutdown().await;
}
