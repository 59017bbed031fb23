//! Integration tests for the redirection handshake
//!
//! Tests the AddRedirect / RemoveRedirect sequences against a scripted host
//! that re-enumerates devices when their port is cycled, including:
//! - Successful hand-off and owner-checked removal
//! - Rollback on reset failure, attach timeout and open exhaustion
//! - Concurrent requests for the same device
//! - Removal driven by redirector file handles

mod support;

use filter::{FilterError, MemoryStore, RedirectionState, StrategyKind};
use protocol::{ControlError, ControlRequest, ControlResponse, ProcessId, RedirectorHandle};
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::{Harness, MockDevice, install_driver, start};

fn harness_with_device() -> (Harness, MockDevice) {
    let store = MemoryStore::new();
    let device = MockDevice::new(0x1234, 0x5678, 1);
    install_driver(&store, &device);
    let h = start(store);
    h.host.plug(h.hub, device.clone());
    (h, device)
}

#[tokio::test(start_paused = true)]
async fn test_redirect_and_remove() {
    let (h, device) = harness_with_device();
    let id = device.id();
    let original = h.host.node_of(&id).unwrap();
    assert!(h.control.filter(original).is_none());
    assert_eq!(h.control.count_devices(), 1);

    let handle = h.control.add_redirect(&id, ProcessId(42)).await.unwrap();

    let redirected = h.host.node_of(&id).unwrap();
    assert_ne!(redirected, original);
    assert_eq!(handle, RedirectorHandle(0xF000 | redirected.0));
    assert_eq!(
        h.control.filter(redirected).unwrap().kind(),
        StrategyKind::Redirector
    );

    let redirection = h.control.registry().find_redirection(&id).unwrap();
    assert_eq!(redirection.state(), RedirectionState::Attached);
    assert_eq!(redirection.owner(), ProcessId(42));
    assert!(redirection.redirector().is_some());

    // Only the owner (or ANY) may tear it down
    let denied = h.control.remove_redirect(&id, ProcessId(7)).await;
    assert!(matches!(denied, Err(FilterError::NotFound(_))));
    assert_eq!(h.control.registry().redirection_count(), 1);

    h.control.remove_redirect(&id, ProcessId(42)).await.unwrap();
    assert_eq!(redirection.state(), RedirectionState::Removed);
    assert!(redirection.redirector().is_none());
    assert_eq!(h.control.registry().redirection_count(), 0);

    let restored = h.host.node_of(&id).unwrap();
    assert!(h.control.filter(restored).is_none());
    assert_eq!(h.host.cycle_count(), 2);
    assert_eq!(h.control.count_devices(), 1);

    h.control.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_redirect_unknown_device() {
    let (h, _device) = harness_with_device();
    let missing = MockDevice::new(0xDEAD, 0xBEEF, 9).id();

    let result = h.control.add_redirect(&missing, ProcessId(42)).await;
    assert!(matches!(result, Err(FilterError::NotFound(_))));
    assert_eq!(h.control.registry().redirection_count(), 0);
    assert_eq!(h.host.cycle_count(), 0);

    let response = h
        .control
        .dispatch(ControlRequest::AddRedirect {
            id: missing,
            requestor: ProcessId(42),
        })
        .await;
    assert_eq!(response, Err(ControlError::NotFound));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_redirects() {
    let (h, device) = harness_with_device();
    let id = device.id();

    let (a, b) = tokio::join!(
        h.control.add_redirect(&id, ProcessId(1)),
        h.control.add_redirect(&id, ProcessId(2))
    );
    let results = [a, b];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(FilterError::AlreadyExists(_))))
    );
    assert_eq!(h.control.registry().redirection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_failure_rolls_back_without_reset() {
    let (h, device) = harness_with_device();
    h.host.fail_cycle.store(true, Ordering::SeqCst);

    let err = h
        .control
        .add_redirect(&device.id(), ProcessId(42))
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Platform(_)));
    assert_eq!(ControlError::from(err), ControlError::NotConnected);

    assert_eq!(h.control.registry().redirection_count(), 0);
    assert_eq!(h.host.cycle_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_attach_timeout_rolls_back_with_reset() {
    let (h, device) = harness_with_device();
    h.host.auto_attach.store(false, Ordering::SeqCst);

    let err = h
        .control
        .add_redirect(&device.id(), ProcessId(42))
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Timeout(_)));
    assert_eq!(ControlError::from(err), ControlError::NotConnected);

    assert_eq!(h.control.registry().redirection_count(), 0);
    // Redirecting cycle plus the compensating one
    assert_eq!(h.host.cycle_count(), 2);
    // Only the first re-enumeration asked for our filter
    assert_eq!(h.host.attaches.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handle_open_retries() {
    let (h, device) = harness_with_device();
    h.host.refuse_opens.store(3, Ordering::SeqCst);

    h.control
        .add_redirect(&device.id(), ProcessId(42))
        .await
        .unwrap();
    assert_eq!(h.host.opens.lock().len(), 1);
    assert_eq!(h.control.registry().redirection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handle_open_exhaustion_rolls_back() {
    let (h, device) = harness_with_device();
    h.host.refuse_opens.store(usize::MAX, Ordering::SeqCst);

    let err = h
        .control
        .add_redirect(&device.id(), ProcessId(42))
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Timeout("redirector handle")));
    assert_eq!(h.control.registry().redirection_count(), 0);
    assert_eq!(h.host.cycle_count(), 2);

    // The compensating cycle brought the device back unfiltered
    let node = h.host.node_of(&device.id()).unwrap();
    assert!(h.control.filter(node).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_removal_during_handle_open_aborts_redirect() {
    let (h, device) = harness_with_device();
    let id = device.id();
    h.host.refuse_opens.store(usize::MAX, Ordering::SeqCst);

    let (added, removed) = tokio::join!(h.control.add_redirect(&id, ProcessId(42)), async {
        // Lands between two open attempts
        tokio::time::sleep(Duration::from_millis(110)).await;
        h.control.remove_redirect(&id, ProcessId::ANY).await
    });

    let err = added.unwrap_err();
    assert!(matches!(err, FilterError::RemovalInProgress(_)));
    assert_eq!(ControlError::from(err), ControlError::DeviceRemoved);
    removed.unwrap();

    assert_eq!(h.control.registry().redirection_count(), 0);
    // Redirecting cycle, the removal's cycle and the compensating one
    assert_eq!(h.host.cycle_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_remove_timeout_keeps_entry() {
    let (h, device) = harness_with_device();
    let id = device.id();
    h.control.add_redirect(&id, ProcessId(42)).await.unwrap();
    // Let the pre-redirection child finish its teardown first
    h.control.flush_teardown().await;

    h.host.reenumerate_on_cycle.store(false, Ordering::SeqCst);
    let err = h.control.remove_redirect(&id, ProcessId(42)).await.unwrap_err();
    assert!(matches!(err, FilterError::Timeout(_)));
    assert_eq!(ControlError::from(err), ControlError::NotConnected);

    let redirection = h.control.registry().find_redirection(&id).unwrap();
    assert_eq!(redirection.state(), RedirectionState::RemovalStarted);
    assert!(!h.control.registry().should_redirect(&id));

    // The caller may retry once the device cooperates
    h.host.reenumerate_on_cycle.store(true, Ordering::SeqCst);
    let response = h
        .control
        .dispatch(ControlRequest::RemoveRedirect {
            id: id.clone(),
            pid: ProcessId::ANY,
        })
        .await;
    assert_eq!(response, Ok(ControlResponse::Done));
    assert_eq!(h.control.registry().redirection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_file_close_drives_removal() {
    let (h, device) = harness_with_device();
    let id = device.id();

    let response = h
        .control
        .dispatch(ControlRequest::AddRedirect {
            id: id.clone(),
            requestor: ProcessId(42),
        })
        .await
        .unwrap();
    assert!(matches!(response, ControlResponse::Redirected(_)));

    let node = h.host.node_of(&id).unwrap();
    h.control.on_file_create(node);
    h.control.on_file_create(node);

    // Another handle is still open, so the closer must own the redirection
    let result = h.control.on_file_close(node, ProcessId(7)).await;
    assert!(matches!(result, Err(FilterError::NotFound(_))));
    assert_eq!(h.control.registry().redirection_count(), 1);

    // Last close removes it for whoever owns it
    h.control.on_file_close(node, ProcessId(7)).await.unwrap();
    assert_eq!(h.control.registry().redirection_count(), 0);
    assert!(h.control.filter(node).is_none());
}
