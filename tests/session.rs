// session
// Integration tests for connect, resource protection and memory access
// Uses the simulated target in test_server

use std::time::Duration;

use xcp_master::*;

mod test_server;
use test_server::*;

//-----------------------------------------------------------------------------
// Connect

#[tokio::test]
async fn test_connect_negotiates_session_config() {
    init_logging();
    let (server, transport) = TestServer::start(TargetOptions::default());
    let xcp = master(transport);

    let config = xcp.connect().await.unwrap();
    assert_eq!(xcp.state().await, SessionState::Connected);
    assert_eq!(config.protocol_version, ProtocolVersion { major: 1, minor: 4 });
    assert_eq!(config.granularity, AddressGranularity::Byte);
    assert_eq!(config.byte_order, Endianness::Little);
    assert_eq!(config.max_cto, 8);
    assert_eq!(config.max_dto, 1400);
    assert!(config.resources.contains(Resource::DAQ | Resource::CAL_PAG));
    assert!(config.protection.is_empty());

    let daq = &config.daq;
    assert_eq!(daq.config_type, DaqConfigType::Dynamic);
    assert_eq!(daq.identification, IdentificationField::RelativeWordAligned);
    assert_eq!(daq.max_daq, 16);
    assert_eq!(
        daq.timestamp,
        Some(TimestampMode {
            size: 4,
            fixed: false,
            resolution_ns: 1000
        })
    );
    assert_eq!(daq.events.len(), 2);
    assert_eq!(daq.events[0].name, "10ms");
    assert_eq!(daq.events[0].cycle, Duration::from_millis(10));
    assert_eq!(daq.events[1].name, "100ms");
    assert_eq!(daq.events[1].cycle, Duration::from_millis(100));

    // Identification is transferred by upload
    let id = xcp.get_id(XCP_IDT_ASCII).await.unwrap();
    assert_eq!(id, b"xcp_test_target");

    let status = xcp.get_status().await.unwrap();
    assert!(status.protection.is_empty());
    xcp.synch().await.unwrap();

    xcp.disconnect().await.unwrap();
    assert_eq!(xcp.state().await, SessionState::Disconnected);
    assert!(xcp.session_config().await.is_none());
    assert!(!server.state.lock().connected);
}

#[tokio::test]
async fn test_connect_twice_rejected() {
    let (_server, transport) = TestServer::start(TargetOptions::default());
    let xcp = master(transport);
    xcp.connect().await.unwrap();
    let res = xcp.connect().await;
    assert!(matches!(res, Err(XcpError::InvalidState { state: SessionState::Connected, .. })));
    assert_eq!(xcp.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_connect_timeout_returns_disconnected() {
    let (server, transport) = TestServer::start(TargetOptions::default());
    server.state.lock().silent = true;
    let xcp = XcpMasterBuilder::new().set_command_timeout(Duration::from_millis(20)).set_max_retries(1).build(transport);

    let res = xcp.connect().await;
    assert!(matches!(res, Err(XcpError::Transaction(TransactionError::Timeout))));
    assert_eq!(xcp.state().await, SessionState::Disconnected);
    // CONNECT and one resend
    assert_eq!(server.state.lock().count(CC_CONNECT), 2);

    // Target comes back
    server.state.lock().silent = false;
    xcp.connect().await.unwrap();
    assert_eq!(xcp.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_connect_rejected() {
    let (server, transport) = TestServer::start(TargetOptions::default());
    server.state.lock().reject = Some((CC_CONNECT, CRC_CMD_BUSY));
    let xcp = master(transport);
    let res = xcp.connect().await;
    assert_eq!(res.unwrap_err().error_code(), Some(ErrorCode(CRC_CMD_BUSY)));
    assert_eq!(xcp.state().await, SessionState::Disconnected);
    // The target never accepted CONNECT
    assert_eq!(server.state.lock().count(CC_DISCONNECT), 0);
}

#[tokio::test]
async fn test_connect_fails_after_connect_accepted() {
    let (server, transport) = TestServer::start(TargetOptions::default());
    server.state.lock().reject = Some((CC_GET_STATUS, CRC_CMD_BUSY));
    let xcp = master(transport);

    let res = xcp.connect().await;
    assert_eq!(res.unwrap_err().error_code(), Some(ErrorCode(CRC_CMD_BUSY)));
    assert_eq!(xcp.state().await, SessionState::Disconnected);
    {
        // The target was connected by CONNECT and must be released
        let s = server.state.lock();
        assert_eq!(s.count(CC_DISCONNECT), 1);
        assert!(!s.connected);
    }

    server.state.lock().reject = None;
    xcp.connect().await.unwrap();
    assert_eq!(xcp.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_big_endian_word_granularity() {
    let (server, transport) = TestServer::start(TargetOptions {
        byte_order: Endianness::Big,
        granularity: AddressGranularity::Word,
        max_cto: 16,
        ..TargetOptions::default()
    });
    let xcp = master(transport);
    let config = xcp.connect().await.unwrap();
    assert_eq!(config.byte_order, Endianness::Big);
    assert_eq!(config.granularity, AddressGranularity::Word);

    xcp.write_value(0x2000, 0, ValueType::U32, &Value::Unsigned(0x12345678)).await.unwrap();
    assert_eq!(server.peek(0x2000, 4), vec![0x12, 0x34, 0x56, 0x78]);
    let v = xcp.read_value(0x2000, 0, ValueType::U32, 4).await.unwrap();
    assert_eq!(v, Value::Unsigned(0x12345678));

    // Odd sizes can not be expressed in words
    let res = xcp.read_memory(0x2000, 0, 3).await;
    assert!(matches!(res, Err(XcpError::Codec(_))));
    assert_eq!(xcp.state().await, SessionState::Connected);
}

//-----------------------------------------------------------------------------
// Memory

#[tokio::test]
async fn test_read_write_memory_chunked() {
    let (server, transport) = TestServer::start(TargetOptions::default());
    let xcp = master(transport);
    xcp.connect().await.unwrap();

    // Larger than one CTO, SET_MTA + DOWNLOAD and SET_MTA + UPLOAD
    // Event names were uploaded on connect
    let uploads = server.state.lock().count(CC_UPLOAD);
    let data: Vec<u8> = (0..40).collect();
    xcp.write_memory(0x1000, 0, &data).await.unwrap();
    assert_eq!(server.peek(0x1000, 40), data);
    assert_eq!(xcp.read_memory(0x1000, 0, 40).await.unwrap(), data);

    {
        let s = server.state.lock();
        assert_eq!(s.count(CC_DOWNLOAD), 7);
        assert_eq!(s.count(CC_UPLOAD) - uploads, 6);
    }

    // Small transfers use the short commands
    server.poke(0x3000, &[0xAA, 0xBB]);
    assert_eq!(xcp.read_memory(0x3000, 0, 2).await.unwrap(), vec![0xAA, 0xBB]);
    assert_eq!(server.state.lock().count(CC_SHORT_UPLOAD), 1);

    let checksum = xcp.build_checksum(0x1000, 0, 40).await.unwrap();
    assert_eq!(checksum.value, (0..40).sum::<u32>());
}

#[tokio::test]
async fn test_read_value_types() -> anyhow::Result<()> {
    let (server, transport) = TestServer::start(TargetOptions::default());
    let xcp = master(transport);
    xcp.connect().await?;

    server.poke(0x100, &(-5i16).to_le_bytes());
    server.poke(0x200, &1.5f64.to_le_bytes());
    assert_eq!(xcp.read_value(0x100, 0, ValueType::I16, 2).await?, Value::Signed(-5));
    assert_eq!(xcp.read_value(0x200, 0, ValueType::F64, 8).await?, Value::Float(1.5));
    assert_eq!(xcp.read_value(0x100, 0, ValueType::Bytes, 3).await?, Value::Bytes(vec![0xFB, 0xFF, 0x00]));
    xcp.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn test_rejected_command_keeps_session() {
    let (server, transport) = TestServer::start(TargetOptions::default());
    let xcp = master(transport);
    xcp.connect().await.unwrap();

    let res = xcp.read_memory(0xFFFF_0000, 0, 4).await;
    assert_eq!(res.unwrap_err().error_code(), Some(ErrorCode(CRC_OUT_OF_RANGE)));
    assert_eq!(xcp.state().await, SessionState::Connected);
    assert_eq!(xcp.read_memory(0, 0, 4).await.unwrap(), vec![0, 0, 0, 0]);
    drop(server);
}

#[tokio::test]
async fn test_get_id_length_limit() {
    let (server, transport) = TestServer::start(TargetOptions::default());
    let xcp = master(transport);
    xcp.connect().await.unwrap();

    server.state.lock().id_length = Some(0xFFFF_FFFF);
    let uploads = server.state.lock().count(CC_UPLOAD);
    let res = xcp.get_id(XCP_IDT_ASCII).await;
    assert!(matches!(res, Err(XcpError::Protocol(_))));
    assert_eq!(server.state.lock().count(CC_UPLOAD), uploads);
    assert_eq!(xcp.state().await, SessionState::Connected);

    // The next GET_ID restarts the identification upload
    server.state.lock().id_length = None;
    assert_eq!(xcp.get_id(XCP_IDT_ASCII).await.unwrap(), b"xcp_test_target");
}

//-----------------------------------------------------------------------------
// Resource protection

#[tokio::test]
async fn test_unlock_and_calibrate() {
    let (server, transport) = TestServer::start(TargetOptions {
        protection: Resource::CAL_PAG,
        seed_len: 10,
        ..TargetOptions::default()
    });
    let xcp = master(transport);
    let config = xcp.connect().await.unwrap();
    assert_eq!(config.protection, Resource::CAL_PAG);

    let res = xcp.write_memory(0x1000, 0, &[1, 2, 3, 4]).await;
    assert!(matches!(res, Err(XcpError::AccessDenied(r)) if r == Resource::CAL_PAG));

    let remaining = xcp.unlock(Resource::CAL_PAG).await.unwrap();
    assert!(remaining.is_empty());
    assert_eq!(xcp.state().await, SessionState::Unlocked);

    // Seed and key of 10 bytes need two GET_SEED and two UNLOCK with MAX_CTO 8
    {
        let s = server.state.lock();
        assert_eq!(s.count(CC_GET_SEED), 2);
        assert_eq!(s.count(CC_UNLOCK), 2);
    }

    xcp.write_memory(0x1000, 0, &[1, 2, 3, 4]).await.unwrap();
    assert_eq!(server.peek(0x1000, 4), vec![1, 2, 3, 4]);
    assert_eq!(xcp.read_value(0x1000, 0, ValueType::U32, 4).await.unwrap(), Value::Unsigned(0x04030201));
}

#[tokio::test]
async fn test_unlock_rejected_keeps_connection() {
    let (server, transport) = TestServer::start(TargetOptions {
        protection: Resource::CAL_PAG,
        ..TargetOptions::default()
    });
    let xcp = XcpMasterBuilder::new()
        .set_command_timeout(Duration::from_millis(200))
        .set_key_provider(XorKeyProvider::new(&[0xAA]))
        .build(transport);
    xcp.connect().await.unwrap();

    let res = xcp.unlock(Resource::CAL_PAG).await;
    assert!(matches!(res, Err(XcpError::UnlockDenied(r)) if r == Resource::CAL_PAG));
    assert_eq!(xcp.state().await, SessionState::Connected);
    assert_eq!(xcp.protection().await, Resource::CAL_PAG);

    // Calibration stays protected
    let res = xcp.write_memory(0x1000, 0, &[1]).await;
    assert!(matches!(res, Err(XcpError::AccessDenied(_))));
    assert_eq!(server.peek(0x1000, 1), vec![0]);

    // Unprotected resources remain usable
    server.poke(0x1000, &[7]);
    assert_eq!(xcp.read_memory(0x1000, 0, 1).await.unwrap(), vec![7]);
    let lists = xcp.allocate(&[MeasurementBinding::new(0x1000, ValueType::U8, 0)]).await.unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(xcp.state().await, SessionState::ConfiguringDaq);
}

#[tokio::test]
async fn test_unlock_without_key_provider() {
    let (_server, transport) = TestServer::start(TargetOptions {
        protection: Resource::CAL_PAG | Resource::DAQ,
        ..TargetOptions::default()
    });
    let xcp = XcpMasterBuilder::new().build(transport);
    xcp.connect().await.unwrap();
    let res = xcp.unlock(Resource::CAL_PAG).await;
    assert!(matches!(res, Err(XcpError::Key(KeyError::NotConfigured))));
    assert_eq!(xcp.state().await, SessionState::Connected);

    // DAQ is protected too
    let res = xcp.allocate(&[MeasurementBinding::new(0x1000, ValueType::U8, 0)]).await;
    assert!(matches!(res, Err(XcpError::AccessDenied(r)) if r == Resource::DAQ));
}

#[tokio::test]
async fn test_unlock_closure_key_provider() {
    let (_server, transport) = TestServer::start(TargetOptions {
        protection: Resource::CAL_PAG | Resource::DAQ,
        ..TargetOptions::default()
    });
    let xcp = XcpMasterBuilder::new()
        .set_key_provider(|_resource: Resource, seed: &[u8]| -> Result<Vec<u8>, KeyError> { Ok(seed.iter().map(|b| b ^ 0x55).collect()) })
        .build(transport);
    xcp.connect().await.unwrap();

    // Unlock only DAQ, calibration stays protected
    let remaining = xcp.unlock(Resource::DAQ).await.unwrap();
    assert_eq!(remaining, Resource::CAL_PAG);
    assert_eq!(xcp.state().await, SessionState::Unlocked);
    assert!(matches!(xcp.write_memory(0, 0, &[1]).await, Err(XcpError::AccessDenied(_))));

    let remaining = xcp.unlock(Resource::CAL_PAG | Resource::DAQ).await.unwrap();
    assert!(remaining.is_empty());
    xcp.write_memory(0, 0, &[1]).await.unwrap();
}

//-----------------------------------------------------------------------------
// Transport failure

#[tokio::test]
async fn test_transport_failure_enters_error_state() {
    let (server, transport) = TestServer::start(TargetOptions::default());
    let xcp = master(transport);
    xcp.connect().await.unwrap();

    server.shutdown().await;
    let res = xcp.read_memory(0, 0, 4).await;
    assert!(res.unwrap_err().is_fatal());
    assert_eq!(xcp.state().await, SessionState::Error);

    // Only disconnect leaves the error state
    assert!(matches!(xcp.get_status().await, Err(XcpError::InvalidState { state: SessionState::Error, .. })));
    xcp.disconnect().await.unwrap();
    assert_eq!(xcp.state().await, SessionState::Disconnected);
}
