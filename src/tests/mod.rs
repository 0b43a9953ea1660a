#[cfg(test)]
mod tests {
    use crate::codec::{Complex, EncryptedJson, PlainJson, Value, ValueCodec};
    use crate::query::{FilterOp, QueryOptions};
    use crate::record::Timestamp;
    use crate::transport::{HttpRequest, HttpResponse, Method, Transport};
    use crate::usage::RateLimitKind;
    use crate::{Error, Result, StreamClient, StreamIdentity};
    use async_trait::async_trait;
    use mockall::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio_test::{assert_err, assert_ok};

    mock! {
        pub Transport {}
        #[async_trait]
        impl Transport for Transport {
            async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
        }
    }

    const BASE_URL: &str = "http://data.example.com";

    fn identity(private_key: Option<&str>) -> StreamIdentity {
        StreamIdentity {
            public_key: "foo".to_string(),
            private_key: private_key.map(String::from),
            delete_key: None,
            base_url: BASE_URL.to_string(),
            title: None,
        }
    }

    fn client_with_codec(
        transport: MockTransport,
        fields: &[&str],
        private_key: Option<&str>,
        codec: Box<dyn ValueCodec>,
    ) -> StreamClient {
        StreamClient::new(
            identity(private_key),
            fields.iter().map(|f| f.to_string()).collect(),
            codec,
            Box::new(transport),
        )
        .unwrap()
    }

    fn client(transport: MockTransport, fields: &[&str], private_key: Option<&str>) -> StreamClient {
        client_with_codec(transport, fields, private_key, Box::new(PlainJson))
    }

    fn response(status: u16, body: serde_json::Value) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: body.to_string(),
        }
    }

    fn append_response(remaining: u32) -> HttpResponse {
        let mut resp = response(200, json!({"success": true}));
        resp.headers.insert("x-rate-limit-remaining".to_string(), remaining.to_string());
        resp.headers.insert("x-rate-limit-limit".to_string(), "100".to_string());
        resp.headers.insert("x-rate-limit-reset".to_string(), "1620000000".to_string());
        resp.headers.insert("x-rate-limit-remaining-bytes".to_string(), "52428700".to_string());
        resp
    }

    fn is_append(req: &HttpRequest) -> bool {
        req.method == Method::Post && req.url == format!("{}/input/foo.json", BASE_URL) && req.form.len() > 1
    }

    fn is_stats(req: &HttpRequest) -> bool {
        req.method == Method::Get && req.url == format!("{}/output/foo/stats.json", BASE_URL)
    }

    fn is_output(req: &HttpRequest) -> bool {
        req.method == Method::Get && req.url == format!("{}/output/foo.json", BASE_URL)
    }

    #[tokio::test]
    async fn test_append_without_private_key_makes_no_request() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let client = client(transport, &["temp"], None);
        let err = assert_err!(client.append(&[Value::from(21.5)]).await);
        assert!(matches!(err, Error::MissingCredential(_)));

        let err = assert_err!(client.clear().await);
        assert!(matches!(err, Error::MissingCredential(_)));
    }

    #[tokio::test]
    async fn test_append_posts_encoded_values() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| {
                is_append(req)
                    && req.form
                        == vec![
                            ("private_key".to_string(), "bar".to_string()),
                            ("temp".to_string(), "21.5".to_string()),
                            ("name".to_string(), "\"porch\"".to_string()),
                        ]
            })
            .times(1)
            .returning(|_| Ok(append_response(99)));

        let client = client(transport, &["temp", "name"], Some("bar"));
        assert_ok!(client.append(&[Value::from(21.5), Value::from("porch")]).await);
    }

    #[tokio::test]
    async fn test_append_rejects_wrong_value_count() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let client = client(transport, &["temp", "name"], Some("bar"));
        let err = assert_err!(client.append(&[Value::from(1i64)]).await);
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_append_remote_rejection() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(response(400, json!({"success": false, "message": "stream is full"}))));

        let client = client(transport, &["temp"], Some("bar"));
        match client.append(&[Value::from(1i64)]).await {
            Err(Error::RemoteRejected(msg)) => assert_eq!(msg, "stream is full"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(client.remaining_requests().await, -1);
    }

    #[tokio::test]
    async fn test_rate_limits_are_sentinel_until_append() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(is_append)
            .times(1)
            .returning(|_| Ok(append_response(42)));

        let client = client(transport, &["temp"], Some("bar"));
        assert_eq!(client.remaining_requests().await, -1);
        assert_eq!(client.request_limit().await, -1);
        assert_eq!(client.reset_time().await, -1);
        assert_eq!(client.remaining_bytes().await, -1);
        assert!(matches!(
            client.rate_limit(RateLimitKind::RequestLimit).await,
            Err(Error::Unavailable(RateLimitKind::RequestLimit))
        ));

        client.append(&[Value::from(3i64)]).await.unwrap();
        assert_eq!(client.remaining_requests().await, 42);
        assert_eq!(client.request_limit().await, 100);
        assert_eq!(client.reset_time().await, 1_620_000_000);
        assert_eq!(client.remaining_bytes().await, 52_428_700);
    }

    #[tokio::test]
    async fn test_stats_fetched_once_until_append() {
        let mut transport = MockTransport::new();
        let used = Arc::new(Mutex::new(0u64));

        let stats_used = used.clone();
        transport
            .expect_send()
            .withf(is_stats)
            .times(2)
            .returning(move |_| {
                let used = *stats_used.lock().unwrap();
                Ok(response(200, json!({"used": used, "cap": 52428800, "remaining": 52428800 - used})))
            });

        let append_used = used.clone();
        transport
            .expect_send()
            .withf(is_append)
            .times(1)
            .returning(move |_| {
                *append_used.lock().unwrap() += 10;
                Ok(append_response(99))
            });

        let client = client(transport, &["temp"], Some("bar"));
        assert_eq!(client.used_bytes().await.unwrap(), 0);
        assert_eq!(client.cap().await.unwrap(), 52_428_800);
        assert_eq!(client.used_bytes().await.unwrap(), 0);

        client.append(&[Value::from(1i64)]).await.unwrap();
        assert_eq!(client.used_bytes().await.unwrap(), 10);
        assert_eq!(client.stats(false).await.unwrap().remaining, Some(52_428_790));
    }

    #[tokio::test]
    async fn test_stats_force_refresh() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(is_stats)
            .times(2)
            .returning(|_| Ok(response(200, json!({"used": 5, "cap": 100}))));

        let client = client(transport, &["temp"], None);
        client.stats(false).await.unwrap();
        client.stats(false).await.unwrap();
        client.stats(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_remote_rejection() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(is_output)
            .times(1)
            .returning(|_| Ok(response(200, json!({"success": false, "message": "bad field"}))));

        let client = client(transport, &["temp"], None);
        match client.query(&QueryOptions::new()).await {
            Err(Error::RemoteRejected(msg)) => assert_eq!(msg, "bad field"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_sorts_by_field() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| is_output(req) && req.query.is_none())
            .times(1)
            .returning(|_| {
                Ok(response(
                    200,
                    json!([
                        {"x": "3", "timestamp": "2021-05-01T10:00:03.000Z"},
                        {"x": "1", "timestamp": "2021-05-01T10:00:01.000Z"},
                        {"x": "2", "timestamp": "2021-05-01T10:00:02.000Z"},
                    ]),
                ))
            });

        let client = client(transport, &["x"], None);
        let records = client.query(&QueryOptions::new().sort_by("x")).await.unwrap();
        let xs: Vec<f64> = records.iter().map(|r| r.get("x").unwrap().as_f64().unwrap()).collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_query_sends_literal_filter_string() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| {
                is_output(req)
                    && req.query.as_deref()
                        == Some("limit=5&timezone=America/Chicago&eq[temp]=21&gt[timestamp]=2021-05-01")
            })
            .times(1)
            .returning(|_| {
                Ok(response(
                    200,
                    json!([{"temp": "21", "timestamp": "2021-05-01T10:00:00-05:00"}]),
                ))
            });

        let client = client(transport, &["temp"], None);
        let options = QueryOptions::new()
            .limit(5)
            .timezone("America/Chicago")
            .filter(FilterOp::Gt, "timestamp", "2021-05-01")
            .filter(FilterOp::Eq, "temp", "21");
        let records = client.query(&options).await.unwrap();

        assert_eq!(records.len(), 1);
        match records[0].timestamp {
            Timestamp::Local(dt) => assert_eq!(dt.to_string(), "2021-05-01 10:00:00"),
            ref other => panic!("unexpected {:?}", other),
        }
        assert_eq!(records[0].get("temp"), Some(&Value::from(21i64)));
    }

    #[tokio::test]
    async fn test_query_unknown_filter_field_makes_no_request() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let client = client(transport, &["temp"], None);
        let options = QueryOptions::new().filter(FilterOp::Eq, "pressure", "1000");
        let err = assert_err!(client.query(&options).await);
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("pressure")));
    }

    #[tokio::test]
    async fn test_query_raw_timestamps() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(response(200, json!([{"temp": "not json", "timestamp": "soon"}]))));

        let client = client(transport, &["temp"], None);
        let records = client.query(&QueryOptions::new().raw_timestamps()).await.unwrap();
        assert_eq!(records[0].timestamp, Timestamp::Raw("soon".to_string()));
        assert_eq!(records[0].get("temp"), Some(&Value::from("not json")));
    }

    #[tokio::test]
    async fn test_field_discovery_runs_once() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| req.method == Method::Post && req.form.len() == 1)
            .times(1)
            .returning(|_| {
                Ok(response(
                    400,
                    json!({"success": false, "message": "Error: missing fields. expecting: temp, humidity"}),
                ))
            });
        transport
            .expect_send()
            .withf(|req| is_append(req) && req.form.len() == 3)
            .times(2)
            .returning(|_| Ok(append_response(10)));

        let client = client(transport, &[], Some("bar"));
        client.append(&[Value::from(20i64), Value::from(55i64)]).await.unwrap();
        client.append(&[Value::from(21i64), Value::from(54i64)]).await.unwrap();
        assert_eq!(client.fields().await.unwrap(), ["temp", "humidity"]);
        assert_eq!(
            client.extended_fields().await.unwrap(),
            vec!["temp", "humidity", "timestamp"]
        );
    }

    #[tokio::test]
    async fn test_unrecognized_discovery_response() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(response(404, json!({"success": false, "message": "stream not found"}))));

        let client = client(transport, &[], Some("bar"));
        let err = assert_err!(client.fields().await);
        assert!(matches!(err, Error::Discovery(_)));
    }

    #[tokio::test]
    async fn test_query_without_field_references_skips_discovery() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(is_output)
            .times(1)
            .returning(|_| Ok(response(200, json!([]))));

        let client = client(transport, &[], None);
        assert!(client.query(&QueryOptions::new().limit(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_query_on_timestamp_skips_discovery() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|req| is_output(req) && req.query.as_deref() == Some("gt[timestamp]=2021-05-01"))
            .times(1)
            .returning(|_| Ok(response(200, json!([]))));
        transport
            .expect_send()
            .withf(|req| is_output(req) && req.query.is_none())
            .times(1)
            .returning(|_| Ok(response(200, json!([]))));

        let client = client(transport, &[], None);
        let by_time = QueryOptions::new().filter(FilterOp::Gt, "timestamp", "2021-05-01");
        assert_ok!(client.query(&by_time).await);
        assert_ok!(client.query(&QueryOptions::new().sort_by("timestamp")).await);
    }

    #[tokio::test]
    async fn test_read_only_query_on_unknown_field_is_validation_error() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let client = client(transport, &[], None);
        let options = QueryOptions::new().filter(FilterOp::Eq, "temp", "20");
        let err = assert_err!(client.query(&options).await);
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("temp")));
    }

    #[tokio::test]
    async fn test_query_option_errors_precede_discovery() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let client = client(transport, &[], Some("bar"));
        for options in [
            QueryOptions::new().limit(0).filter(FilterOp::Eq, "temp", "20"),
            QueryOptions::new().timezone(" ").sort_by("temp"),
            QueryOptions::new()
                .filter(FilterOp::Gt, "temp", "1")
                .filter(FilterOp::Gt, "humidity", "2"),
        ] {
            let err = assert_err!(client.query(&options).await);
            assert!(matches!(err, Error::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_accepted_discovery_post_updates_usage() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(is_stats)
            .times(2)
            .returning(|_| Ok(response(200, json!({"used": 61, "cap": 52428800}))));
        transport
            .expect_send()
            .withf(|req| req.method == Method::Post && req.form.len() == 1)
            .times(1)
            .returning(|_| Ok(append_response(10)));

        let client = client(transport, &[], Some("bar"));
        assert_eq!(client.used_bytes().await.unwrap(), 61);

        let err = assert_err!(client.fields().await);
        assert!(matches!(err, Error::Discovery(_)));
        assert_eq!(client.remaining_requests().await, 10);
        assert_eq!(client.used_bytes().await.unwrap(), 61);
    }

    #[tokio::test]
    async fn test_encrypted_values_round_trip_through_stream() {
        let stored = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
        let mut transport = MockTransport::new();

        let sink = stored.clone();
        transport
            .expect_send()
            .withf(is_append)
            .times(1)
            .returning(move |req| {
                *sink.lock().unwrap() = req.form.into_iter().skip(1).collect();
                Ok(append_response(5))
            });

        let source = stored.clone();
        transport
            .expect_send()
            .withf(is_output)
            .times(1)
            .returning(move |_| {
                let mut row = serde_json::Map::new();
                for (k, v) in source.lock().unwrap().iter() {
                    row.insert(k.clone(), json!(v));
                }
                row.insert("timestamp".to_string(), json!("2021-05-01T10:00:00.000Z"));
                Ok(response(200, serde_json::Value::Array(vec![serde_json::Value::Object(row)])))
            });

        let client = client_with_codec(
            transport,
            &["reading", "label"],
            Some("bar"),
            Box::new(EncryptedJson::new("passphrase")),
        );
        let reading = Value::Complex(Complex::new(1.0, -0.5));
        client.append(&[reading.clone(), Value::from("kitchen")]).await.unwrap();

        let wire = stored.lock().unwrap()[1].1.clone();
        assert_ne!(wire, "\"kitchen\"");

        let records = client.query(&QueryOptions::new()).await.unwrap();
        assert_eq!(records[0].get("reading"), Some(&reading));
        assert_eq!(records[0].get("label"), Some(&Value::from("kitchen")));
    }

    #[tokio::test]
    async fn test_clear_sends_private_key_header() {
        let mut transport = MockTransport::new();
        let mut calls = 0;
        transport
            .expect_send()
            .withf(|req| {
                req.method == Method::Delete
                    && req.url == format!("{}/input/foo", BASE_URL)
                    && req.headers.contains(&("Phant-Private-Key".to_string(), "bar".to_string()))
            })
            .times(2)
            .returning(move |_| {
                calls += 1;
                if calls == 1 {
                    Ok(response(200, json!({"success": true})))
                } else {
                    Ok(response(500, json!("boom")))
                }
            });

        let client = client(transport, &["temp"], Some("bar"));
        assert_ok!(client.clear().await);
        let err = assert_err!(client.clear().await);
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_urls_and_display() {
        let client = client(MockTransport::new(), &["temp"], None);
        assert_eq!(client.input_url(".json"), "http://data.example.com/input/foo.json");
        assert_eq!(client.output_url("/stats.json"), "http://data.example.com/output/foo/stats.json");
        assert_eq!(client.manage_url(""), "http://data.example.com/streams/foo");
        assert_eq!(client.to_string(), "Phant@foo");
    }

    #[test]
    fn test_reserved_and_duplicate_fields_rejected() {
        let reserved = StreamClient::new(
            identity(None),
            vec!["timestamp".to_string()],
            Box::new(PlainJson),
            Box::new(MockTransport::new()),
        );
        assert!(matches!(reserved, Err(Error::Validation(_))));

        let duplicate = StreamClient::new(
            identity(None),
            vec!["temp".to_string(), "temp".to_string()],
            Box::new(PlainJson),
            Box::new(MockTransport::new()),
        );
        assert!(matches!(duplicate, Err(Error::Validation(_))));
    }
}
