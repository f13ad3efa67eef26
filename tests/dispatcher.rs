mod common;

use common::{dispatcher, image, leftovers, request, script, storage_at, unconfigured_storage, Behavior, FakeSandbox};
use gpu_worker::error::JobError;
use gpu_worker::hasher::result_hash;
use mockito::Matcher;
use serde_json::json;
use tempfile::tempdir;

#[tokio::test]
async fn identical_scripts_hash_identically() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::Succeed);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    let first = worker.process(script(42, "print('RESULT:17')")).await.unwrap();
    let second = worker.process(script(42, "print('RESULT:17')")).await.unwrap();

    assert_eq!(first.result, "print('RESULT:17')");
    assert_eq!(first.result_hash, second.result_hash);
    assert_eq!(first.result_hash, result_hash(first.result.as_bytes()));
    assert!(first.result_hash.starts_with("0x"));
    assert_eq!(first.logs, "print('RESULT:17')\n");
    assert_eq!(worker.jobs_processed(), 2);
}

#[tokio::test]
async fn empty_payloads_never_reach_the_sandbox() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::Succeed);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    let err = worker
        .process(request(3, "python-script", json!({ "code": "" })))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::MalformedJobDescriptor(_)), "{err:?}");

    let err = worker
        .process(request(3, "docker-image", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::MalformedJobDescriptor(_)), "{err:?}");

    assert_eq!(sandbox.calls(), 0);
    assert_eq!(worker.jobs_processed(), 0);
}

#[tokio::test]
async fn descriptions_are_refused_without_a_work_area() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::Succeed);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    let err = worker
        .process(request(5, "simple", json!({ "description": "train a model" })))
        .await
        .unwrap_err();

    assert!(matches!(&err, JobError::UnsupportedJobKind(kind) if kind == "simple"));
    assert_eq!(err.kind(), "UnsupportedJobKind");
    assert_eq!(sandbox.calls(), 0);
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn failing_script_keeps_partial_output() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::FailWithPartialOutput);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    let err = worker
        .process(script(42, "print('RESULT:17'); raise SystemExit(1)"))
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::ScriptExecutionFailed { .. }), "{err:?}");
    assert!(err.logs().contains("RESULT:17"));
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn timed_out_job_leaves_nothing_behind() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::TimeOut);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    let err = worker.process(script(9, "while True: pass")).await.unwrap_err();

    assert_eq!(err.kind(), "TimedOut");
    assert_eq!(err.logs(), "still working");
    let areas = sandbox.areas();
    assert_eq!(areas.len(), 2);
    for path in areas {
        assert!(!path.exists(), "{} survived", path.display());
    }
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn resubmitted_job_id_gets_a_fresh_area() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::Succeed);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    worker.process(script(1, "print(1)")).await.unwrap();
    worker.process(script(1, "print(1)")).await.unwrap();

    let areas = sandbox.areas();
    assert_eq!(areas.len(), 4);
    assert_ne!(areas[0], areas[2]);
    assert_ne!(areas[1], areas[3]);
    assert!(areas.iter().all(|path| !path.exists()));
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn image_job_reports_the_uploaded_locator() {
    let mut server = mockito::Server::new_async().await;
    let image_pin = server
        .mock("POST", "/pinning/pinFileToIPFS")
        .match_header("authorization", "Bearer test-jwt")
        .match_body(Matcher::Regex("job-7-out.png".to_string()))
        .with_status(200)
        .with_body(r#"{"IpfsHash":"QmImage"}"#)
        .expect(1)
        .create_async()
        .await;
    let metadata_pin = server
        .mock("POST", "/pinning/pinJSONToIPFS")
        .match_body(Matcher::PartialJson(json!({
            "pinataContent": {
                "jobId": 7,
                "image": "ipfs://QmImage",
                "imageFilename": "out.png",
                "mimeType": "image/png",
                "platform": "gpu-worker",
            },
            "pinataMetadata": { "name": "job-7-metadata.json" },
        })))
        .with_status(200)
        .with_body(r#"{"IpfsHash":"QmMeta"}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::RenderPng);
    let worker = dispatcher(dir.path(), sandbox.clone(), storage_at(&server.url()));

    let report = worker.process(image(7, "demo/image-gen")).await.unwrap();

    image_pin.assert_async().await;
    metadata_pin.assert_async().await;
    assert_eq!(report.result_hash, "ipfs://QmImage");
    assert_eq!(report.image_locator.unwrap().uri(), "ipfs://QmImage");
    assert_eq!(report.metadata_locator.unwrap().uri(), "ipfs://QmMeta");
    assert_eq!(report.image_url, Some(format!("{}/ipfs/QmImage", server.url())));
    assert_eq!(report.metadata_url, Some(format!("{}/ipfs/QmMeta", server.url())));
    assert_eq!(report.storage_error, None);
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].filename, "out.png");
    assert_eq!(report.artifacts[0].ipfs_hash.as_deref(), Some("QmImage"));
    assert_eq!(sandbox.images(), ["demo/image-gen"]);
    assert!(leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn missing_credential_keeps_the_inline_result() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::RenderPng);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    let report = worker.process(image(7, "demo/image-gen")).await.unwrap();

    assert_eq!(report.result, "rendered 1 image");
    assert_eq!(report.result_hash, result_hash(b"rendered 1 image"));
    assert!(report.image_locator.is_none());
    assert!(report.image_url.is_none());
    assert!(report
        .storage_error
        .as_deref()
        .is_some_and(|e| e.contains("not configured")));
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].data, "ZmFrZSBwbmc=");
    assert_eq!(report.artifacts[0].ipfs_hash, None);
}

#[tokio::test]
async fn rejected_upload_does_not_fail_the_job() {
    let mut server = mockito::Server::new_async().await;
    let rejected = server
        .mock("POST", "/pinning/pinFileToIPFS")
        .with_status(401)
        .with_body(r#"{"error":"invalid token"}"#)
        .create_async()
        .await;

    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::RenderPng);
    let worker = dispatcher(dir.path(), sandbox, storage_at(&server.url()));

    let report = worker.process(image(8, "demo/image-gen")).await.unwrap();

    rejected.assert_async().await;
    assert!(report.result_hash.starts_with("0x"));
    assert!(report
        .storage_error
        .as_deref()
        .is_some_and(|e| e.contains("401")));
}

#[tokio::test]
async fn browse_urls_are_normalized_before_running() {
    let dir = tempdir().unwrap();
    let sandbox = FakeSandbox::new(Behavior::Succeed);
    let worker = dispatcher(dir.path(), sandbox.clone(), unconfigured_storage());

    let report = worker
        .process(image(11, "https://hub.docker.com/r/user/image"))
        .await
        .unwrap();

    assert_eq!(sandbox.images(), ["user/image"]);
    assert_eq!(report.result, "image done");
    assert!(report.artifacts.is_empty());
    assert_eq!(report.storage_error, None);
}
