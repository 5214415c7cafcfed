//! Tests for the PostgreSQL protocol implementation.

use super::protocol::*;
use super::types::*;
use bytes::{Bytes, BytesMut};

/// Frame `body` as a backend message of type `tag`.
fn backend(tag: u8, body: &[u8]) -> Bytes {
    let mut data = BytesMut::new();
    data.extend_from_slice(&[tag]);
    data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    data.extend_from_slice(body);
    data.freeze()
}

fn length_of(encoded: &[u8]) -> i32 {
    i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]])
}

// ============================================================================
// Protocol Message Encoding Tests
// ============================================================================

mod message_encoding {
    use super::*;

    #[test]
    fn test_startup_message_encoding() {
        // Startup message format:
        // - Int32: Length (including self)
        // - Int32: Protocol version (196608 = 3.0)
        // - String pairs: parameter name, value (null-terminated)
        // - Byte: 0 (terminator)
        let params = [("user", "testuser"), ("database", "testdb")];
        let encoded = StartupMessage { params: &params }.encode();

        let length = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(length as usize, encoded.len());

        let version = i32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(version, 196608, "Protocol version should be 3.0 (196608)");

        assert_eq!(&encoded[8..], b"user\0testuser\0database\0testdb\0\0");
    }

    #[test]
    fn test_query_message_encoding() {
        let encoded = QueryMessage { query: "SELECT 1" }.encode();

        assert_eq!(encoded[0], b'Q', "Query message should start with 'Q'");
        // Length = 4 (length field) + 8 (query) + 1 (null terminator) = 13
        assert_eq!(length_of(&encoded), 13, "Length should be 13 for 'SELECT 1'");
    }

    #[test]
    fn test_parse_message_sends_no_types() {
        // Parse: name, query, Int16 parameter type count (always 0 here)
        let encoded = ParseMessage {
            name: "0",
            query: "SELECT $1",
        }
        .encode();

        assert_eq!(encoded[0], b'P');
        assert_eq!(&encoded[5..], b"0\0SELECT $1\0\0\0");
        assert_eq!(length_of(&encoded) as usize, encoded.len() - 1);
    }

    #[test]
    fn test_bind_message_uses_text_and_null() {
        // Bind: portal, statement, 0 param formats, 2 params, 0 result formats
        let params = [Some("42".to_string()), None];
        let encoded = BindMessage {
            portal: "",
            statement: "3",
            params: &params,
        }
        .encode();

        assert_eq!(encoded[0], b'B');
        let mut expected = Vec::new();
        expected.extend_from_slice(b"\x003\x00");
        expected.extend_from_slice(&0i16.to_be_bytes());
        expected.extend_from_slice(&2i16.to_be_bytes());
        expected.extend_from_slice(&2i32.to_be_bytes());
        expected.extend_from_slice(b"42");
        expected.extend_from_slice(&(-1i32).to_be_bytes());
        expected.extend_from_slice(&0i16.to_be_bytes());
        assert_eq!(&encoded[5..], expected.as_slice());
    }

    #[test]
    fn test_describe_message_encoding() {
        let statement = DescribeMessage {
            target: Target::Statement,
            name: "7",
        }
        .encode();
        assert_eq!(&statement[..], b"D\x00\x00\x00\x07S7\x00");

        let portal = DescribeMessage {
            target: Target::Portal,
            name: "",
        }
        .encode();
        assert_eq!(&portal[..], b"D\x00\x00\x00\x06P\x00");
    }

    #[test]
    fn test_execute_message_encoding() {
        let encoded = ExecuteMessage {
            portal: "",
            max_rows: 0,
        }
        .encode();
        assert_eq!(&encoded[..], b"E\x00\x00\x00\x09\x00\x00\x00\x00\x00");
    }

    #[test]
    fn test_sync_and_terminate_encoding() {
        assert_eq!(&SyncMessage.encode()[..], b"S\x00\x00\x00\x04");
        assert_eq!(&TerminateMessage.encode()[..], b"X\x00\x00\x00\x04");
    }

    #[test]
    fn test_sasl_initial_response_encoding() {
        let encoded = SaslInitialResponseMessage {
            mechanism: "SCRAM-SHA-256",
            data: b"n,,n=,r=abc",
        }
        .encode();
        assert_eq!(encoded[0], b'p');
        let mut expected = b"SCRAM-SHA-256\0".to_vec();
        expected.extend_from_slice(&11i32.to_be_bytes());
        expected.extend_from_slice(b"n,,n=,r=abc");
        assert_eq!(&encoded[5..], expected.as_slice());
    }
}

// ============================================================================
// Protocol Message Decoding Tests
// ============================================================================

mod message_decoding {
    use super::*;

    #[test]
    fn test_authentication_ok_decoding() {
        let msg = BackendMessage::decode(backend(b'R', &0i32.to_be_bytes())).unwrap();
        assert!(matches!(msg, BackendMessage::AuthenticationOk));
    }

    #[test]
    fn test_authentication_md5_decoding() {
        let msg =
            BackendMessage::decode(backend(b'R', &[0, 0, 0, 5, 0x12, 0x34, 0x56, 0x78])).unwrap();

        match msg {
            BackendMessage::AuthenticationMD5Password { salt } => {
                assert_eq!(salt, [0x12, 0x34, 0x56, 0x78]);
            }
            other => panic!("Should decode as AuthenticationMD5Password: {:?}", other),
        }
    }

    #[test]
    fn test_authentication_sasl_decoding() {
        let mut body = 10i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        match BackendMessage::decode(backend(b'R', &body)).unwrap() {
            BackendMessage::AuthenticationSASL { mechanisms } => {
                assert_eq!(mechanisms, ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            other => panic!("Should decode as AuthenticationSASL: {:?}", other),
        }
    }

    #[test]
    fn test_ready_for_query_decoding() {
        for (byte, status) in [
            (b'I', TransactionStatus::Idle),
            (b'T', TransactionStatus::InTransaction),
            (b'E', TransactionStatus::Failed),
        ] {
            match BackendMessage::decode(backend(b'Z', &[byte])).unwrap() {
                BackendMessage::ReadyForQuery { status: got } => assert_eq!(got, status),
                other => panic!("Should decode as ReadyForQuery: {:?}", other),
            }
        }
    }

    #[test]
    fn test_row_description_decoding() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(b"id\0");
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&20i32.to_be_bytes());
        body.extend_from_slice(&8i16.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());

        match BackendMessage::decode(backend(b'T', &body)).unwrap() {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, Oid::INT8);
                assert_eq!(fields[0].format, 0);
            }
            other => panic!("Should decode as RowDescription: {:?}", other),
        }
    }

    #[test]
    fn test_data_row_decoding() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&2i16.to_be_bytes());
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(b"42");
        body.extend_from_slice(&(-1i32).to_be_bytes());

        match BackendMessage::decode(backend(b'D', &body)).unwrap() {
            BackendMessage::DataRow { values } => {
                assert_eq!(values.len(), 2);
                assert_eq!(values[0], Some(Bytes::from_static(b"42")));
                assert_eq!(values[1], None);
            }
            other => panic!("Should decode as DataRow: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_data_row_is_rejected() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(&10i32.to_be_bytes());
        body.extend_from_slice(b"short");
        assert!(BackendMessage::decode(backend(b'D', &body)).is_err());
    }

    #[test]
    fn test_command_complete_decoding() {
        match BackendMessage::decode(backend(b'C', b"INSERT 0 1\0")).unwrap() {
            BackendMessage::CommandComplete { tag } => assert_eq!(tag, "INSERT 0 1"),
            other => panic!("Should decode as CommandComplete: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_decoding() {
        let body = b"SERROR\0C42P01\0Mrelation \"foo\" does not exist\0\0";
        match BackendMessage::decode(backend(b'E', body)).unwrap() {
            BackendMessage::ErrorResponse { fields } => {
                assert_eq!(fields.get(&b'S').map(String::as_str), Some("ERROR"));
                assert_eq!(fields.get(&b'C').map(String::as_str), Some("42P01"));
                assert_eq!(
                    fields.get(&b'M').map(String::as_str),
                    Some("relation \"foo\" does not exist")
                );
            }
            other => panic!("Should decode as ErrorResponse: {:?}", other),
        }
    }

    #[test]
    fn test_notification_decoding() {
        let mut body = 4242i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"jobs\0job 17 done\0");
        match BackendMessage::decode(backend(b'A', &body)).unwrap() {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                assert_eq!(process_id, 4242);
                assert_eq!(channel, "jobs");
                assert_eq!(payload, "job 17 done");
            }
            other => panic!("Should decode as NotificationResponse: {:?}", other),
        }
    }

    #[test]
    fn test_parameter_description_decoding() {
        let mut body = 2i16.to_be_bytes().to_vec();
        body.extend_from_slice(&23i32.to_be_bytes());
        body.extend_from_slice(&25i32.to_be_bytes());
        match BackendMessage::decode(backend(b't', &body)).unwrap() {
            BackendMessage::ParameterDescription { type_oids } => {
                assert_eq!(type_oids, [Oid::INT4, Oid::TEXT]);
            }
            other => panic!("Should decode as ParameterDescription: {:?}", other),
        }
    }

    #[test]
    fn test_empty_bodied_messages() {
        for (tag, check) in [
            (b'1', "ParseComplete"),
            (b'2', "BindComplete"),
            (b'3', "CloseComplete"),
            (b'n', "NoData"),
            (b'I', "EmptyQueryResponse"),
        ] {
            let msg = BackendMessage::decode(backend(tag, &[])).unwrap();
            assert_eq!(format!("{:?}", msg), check);
        }
    }

    #[test]
    fn test_unknown_message_type() {
        assert!(BackendMessage::decode(backend(b'?', &[])).is_err());
    }

    #[test]
    fn test_frame_len_waits_for_complete_frames() {
        let frame = backend(b'C', b"SELECT 1\0");
        assert_eq!(BackendMessage::frame_len(&frame[..3]), None);
        assert_eq!(BackendMessage::frame_len(&frame[..frame.len() - 1]), None);
        assert_eq!(BackendMessage::frame_len(&frame), Some(frame.len()));

        let mut two = BytesMut::from(&frame[..]);
        two.extend_from_slice(&frame);
        assert_eq!(BackendMessage::frame_len(&two), Some(frame.len()));
    }

    #[test]
    fn test_notice_formatting() {
        let body = b"SWARNING\0VWARNING\0C01000\0Mthings are odd\0Htry again\0\0";
        let BackendMessage::NoticeResponse { fields } =
            BackendMessage::decode(backend(b'N', body)).unwrap()
        else {
            panic!("Should decode as NoticeResponse");
        };
        assert_eq!(
            format_notice(&fields),
            "WARNING:  things are odd\nHINT:  try again"
        );
    }
}

// ============================================================================
// Text Decoding Tests
// ============================================================================

mod text_decoding {
    use super::*;

    #[test]
    fn test_numeric_types_pass_through() {
        for (oid, text) in [
            (Oid::INT2, "7"),
            (Oid::INT4, "-12"),
            (Oid::INT8, "1099511627776"),
            (Oid::FLOAT8, "1.5"),
            (Oid::NUMERIC, "3.14159265358979323846"),
        ] {
            assert_eq!(
                decode(oid, Some(text.as_bytes())).unwrap(),
                Value::Text(text.to_string())
            );
        }
    }

    #[test]
    fn test_date_time_types_pass_through() {
        for (oid, text) in [
            (Oid::DATE, "2024-02-29"),
            (Oid::TIME, "12:00:00"),
            (Oid::TIMESTAMP, "2024-02-29 12:00:00"),
            (Oid::TIMESTAMPTZ, "2024-02-29 12:00:00+01"),
            (Oid::INTERVAL, "1 day 02:00:00"),
        ] {
            assert_eq!(
                decode(oid, Some(text.as_bytes())).unwrap(),
                Value::Text(text.to_string())
            );
        }
    }

    #[test]
    fn test_null_handling() {
        for oid in [Oid::BOOL, Oid::BYTEA, Oid::TEXT, Oid(600)] {
            assert_eq!(decode(oid, None).unwrap(), Value::Null);
        }
    }
}

// ============================================================================
// Integration Tests (require running PostgreSQL)
// ============================================================================

#[cfg(feature = "postgres-integration-tests")]
mod integration {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{FixedOffset, TimeZone};

    use crate::{Connection, Driver, DriverError, Statement};

    fn dsn() -> String {
        std::env::var("PQWIRE_TEST_DSN")
            .unwrap_or_else(|_| "host=localhost user=postgres password=test dbname=postgres".to_string())
    }

    async fn connect() -> Connection {
        Driver::new().open(&dsn()).await.unwrap()
    }

    async fn select_one<T: crate::FromValue>(
        conn: &mut Connection,
        sql: &str,
        args: &[&(dyn crate::ToValue + Sync)],
    ) -> T {
        let mut rows = conn.query(sql, args).await.unwrap();
        let row = rows.next_row().unwrap().expect("one row");
        row.get(0).unwrap()
    }

    #[tokio::test]
    async fn test_booleans_round_trip() {
        let mut conn = connect().await;
        let yes: bool = select_one(&mut conn, "SELECT $1::bool", &[&true]).await;
        let no: bool = select_one(&mut conn, "SELECT $1::bool", &[&false]).await;
        assert!(yes);
        assert!(!no);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_integer_round_trip() {
        let mut conn = connect().await;
        let big: i64 = select_one(&mut conn, "SELECT $1::int8", &[&1_099_511_627_776i64]).await;
        assert_eq!(big, 1_099_511_627_776);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bytea_round_trip() {
        let mut conn = connect().await;
        let bytes: Vec<u8> =
            select_one(&mut conn, "SELECT $1::bytea", &[&vec![1u8, 2, 3, 4]]).await;
        assert_eq!(bytes, [1, 2, 3, 4]);
        let text: String =
            select_one(&mut conn, "SELECT encode($1::bytea, 'hex')", &[&vec![1u8, 2, 3, 4]]).await;
        assert_eq!(text, "01020304");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_strings_and_null() {
        let mut conn = connect().await;
        let s: String = select_one(&mut conn, "SELECT $1::text", &[&"a 'quoted' string"]).await;
        assert_eq!(s, "a 'quoted' string");
        let none: Option<String> =
            select_one(&mut conn, "SELECT $1::text", &[&Option::<String>::None]).await;
        assert_eq!(none, None);
        let is_null: bool =
            select_one(&mut conn, "SELECT $1::int4 IS NULL", &[&Option::<i32>::None]).await;
        assert!(is_null);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timestamptz_round_trip() {
        let mut conn = connect().await;
        conn.exec("SET TIME ZONE 'UTC'", &[]).await.unwrap();

        let offset = FixedOffset::east_opt(-7 * 3600).unwrap();
        let ts = offset.with_ymd_and_hms(2012, 1, 1, 7, 0, 0).unwrap();
        let back: chrono::DateTime<FixedOffset> =
            select_one(&mut conn, "SELECT $1::timestamptz", &[&ts]).await;
        assert_eq!(back, ts);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_reports_rows_affected() {
        let mut conn = connect().await;
        conn.exec("CREATE TEMP TABLE pqwire_exec (id int8)", &[])
            .await
            .unwrap();
        let inserted = conn
            .exec(
                "INSERT INTO pqwire_exec SELECT generate_series(1, $1::int8)",
                &[&5i64],
            )
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected(), 5);
        assert!(matches!(
            inserted.last_insert_id(),
            Err(DriverError::LastInsertIdUnsupported)
        ));

        let deleted = conn
            .exec("DELETE FROM pqwire_exec WHERE id > $1", &[&3i64])
            .await
            .unwrap();
        assert_eq!(deleted.rows_affected(), 2);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let mut conn = connect().await;
        conn.exec("CREATE TEMP TABLE pqwire_tx (id int4)", &[])
            .await
            .unwrap();

        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO pqwire_tx VALUES ($1)", &[&1i32])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let count: i64 = select_one(&mut conn, "SELECT count(*) FROM pqwire_tx", &[]).await;
        assert_eq!(count, 0);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_keep_the_connection() {
        let mut conn = connect().await;
        match conn.exec("SELECT * FROM pqwire_missing_table", &[]).await {
            Err(DriverError::CommandError { code, .. }) => {
                assert_eq!(code.as_deref(), Some("42P01"))
            }
            other => panic!("unexpected: {:?}", other),
        }
        let one: i64 = select_one(&mut conn, "SELECT 1::int8", &[]).await;
        assert_eq!(one, 1);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cursor_exhaustion() {
        let mut conn = connect().await;
        let mut rows = conn
            .query("SELECT generate_series(1, 3)", &[])
            .await
            .unwrap();
        assert_eq!(rows.columns(), ["generate_series"]);

        let mut dest = vec![crate::Value::Null];
        let mut seen = 0;
        while rows.next(&mut dest).unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert!(!rows.next(&mut dest).unwrap());
        rows.close();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_notify() {
        let mut listener = connect().await;
        let mut notifier = connect().await;

        let mut channel = listener.prepare("LISTEN pqwire_test").await.unwrap();
        assert!(matches!(channel, Statement::Listen(_)));
        assert_eq!(channel.num_input(), 0);
        assert!(matches!(
            channel.exec(&mut listener, &[]).await,
            Err(DriverError::ExecNotSupportedForListen)
        ));

        let waiter = tokio::spawn(async move {
            let mut rows = channel.query(&mut listener, &[]).await.unwrap();
            assert_eq!(rows.columns(), ["NOTIFY payload"]);
            let payload: String = rows.next_row().unwrap().unwrap().get(0).unwrap();
            assert!(rows.next_row().unwrap().is_none());

            channel.close(&mut listener).await.unwrap();
            assert!(matches!(
                channel.close(&mut listener).await,
                Err(DriverError::StatementClosed)
            ));
            listener.close().await.unwrap();
            payload
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        notifier
            .exec("NOTIFY pqwire_test, 'hello'", &[])
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "hello");
        notifier.close().await.unwrap();
    }

    async fn next_payload(channel: &mut Statement, conn: &mut Connection) -> String {
        let mut rows = tokio::time::timeout(Duration::from_secs(5), channel.query(conn, &[]))
            .await
            .unwrap()
            .unwrap();
        rows.next_row().unwrap().unwrap().get(0).unwrap()
    }

    #[tokio::test]
    async fn test_listen_payloads_and_relisten() {
        let mut listener = connect().await;
        let mut notifier = connect().await;

        let mut channel = listener.prepare("LISTEN pqwire_relisten").await.unwrap();

        // A bare NOTIFY carries an empty payload.
        notifier.exec("NOTIFY pqwire_relisten", &[]).await.unwrap();
        assert_eq!(next_payload(&mut channel, &mut listener).await, "");

        notifier
            .exec("NOTIFY pqwire_relisten, 'the payload'", &[])
            .await
            .unwrap();
        assert_eq!(
            next_payload(&mut channel, &mut listener).await,
            "the payload"
        );

        // Closing unlistens: only what is sent after listening again arrives.
        channel.close(&mut listener).await.unwrap();
        notifier
            .exec("NOTIFY pqwire_relisten, 'the first'", &[])
            .await
            .unwrap();
        let mut channel = listener.prepare("LISTEN pqwire_relisten").await.unwrap();
        notifier
            .exec("NOTIFY pqwire_relisten, 'the second'", &[])
            .await
            .unwrap();
        assert_eq!(
            next_payload(&mut channel, &mut listener).await,
            "the second"
        );

        channel.close(&mut listener).await.unwrap();
        listener.close().await.unwrap();
        notifier.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_self_notification_is_not_lost() {
        let mut conn = connect().await;
        let mut channel = conn.prepare("LISTEN pqwire_self").await.unwrap();
        conn.exec("NOTIFY pqwire_self, 'mine'", &[]).await.unwrap();

        let mut rows = tokio::time::timeout(Duration::from_secs(5), channel.query(&mut conn, &[]))
            .await
            .unwrap()
            .unwrap();
        let payload: String = rows.next_row().unwrap().unwrap().get(0).unwrap();
        assert_eq!(payload, "mine");
        channel.close(&mut conn).await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_notices_reach_the_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let driver = Driver::new().notice_handler(move |msg| {
            sink.lock().unwrap().push(msg.to_string());
        });
        let mut conn = driver.open(&dsn()).await.unwrap();
        conn.exec("DO $$ BEGIN RAISE WARNING 'careful'; END $$", &[])
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["WARNING:  careful"]);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_password_is_a_connection_error() {
        let dsn = format!("{} password=definitely-wrong", dsn());
        match Driver::new().open(&dsn).await {
            Err(DriverError::ConnectionError { .. }) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
