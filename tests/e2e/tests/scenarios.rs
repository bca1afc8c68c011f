// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Cross-crate messaging scenarios on host threads
//! TESTS: STRING over a negotiated buffer, RAM cap request, URPC PRINT, fault after unmap

use nexus_e2e::InitNode;
use nexus_rpc::{opcode, RpcConfig, RpcError};
use nexus_urpc::{Status, UrpcConfig};
use nexus_vm::{VmError, BASE_PAGE_SIZE, LARGE_PAGE_SIZE};

#[test]
fn string_over_negotiated_buffer() {
    let node = InitNode::start(UrpcConfig::new()).unwrap();
    let session = node.connect(RpcConfig::new().with_shared_buffer_size(100)).unwrap();
    let capacity = session.shared_buffer().map(|b| b.capacity()).unwrap();
    assert!(capacity >= 100);

    session.send_string("hello").unwrap();
    assert!(session.can_send());
    assert_eq!(node.backend().strings(), vec!["hello".to_string()]);
    node.shutdown().unwrap();
}

#[test]
fn ram_cap_response_is_checked() {
    let node = InitNode::start(UrpcConfig::new()).unwrap();
    let session = node.connect(RpcConfig::new()).unwrap();

    let (ram, granted) = session.get_ram_cap(4096, 4096).unwrap();
    assert!(granted >= 4096);
    assert_eq!(ram.size, granted);
    assert_eq!(ram.base % 4096, 0);

    let raw = session.call(opcode::RAM_CAP_QUERY, &[4096, 4096]).unwrap();
    raw.expect_opcode(opcode::RAM_CAP_RESPONSE).unwrap();
    assert!(raw.arg(0) >= 4096);
    assert_eq!(
        raw.expect_opcode(opcode::SPECIAL_CAP_RESPONSE),
        Err(RpcError::UnexpectedOpcode {
            expected: opcode::SPECIAL_CAP_RESPONSE,
            got: opcode::RAM_CAP_RESPONSE,
        })
    );
    node.shutdown().unwrap();
}

#[test]
fn urpc_print_resets_the_mailbox() {
    let mut node = InitNode::start(UrpcConfig::new()).unwrap();
    let session = node.connect(RpcConfig::new()).unwrap();
    let mut client = node.bind_urpc(&session, UrpcConfig::new().with_mailbox_size(4096)).unwrap();
    assert_eq!(client.mailbox().status().unwrap(), Status::NoData);

    client.print("milan").unwrap();
    assert_eq!(node.backend().serial_output(), b"milan");
    assert_eq!(client.mailbox().status().unwrap(), Status::NoData);

    let reply = client.call(nexus_urpc::proto::PRINT, b"milan\0").unwrap();
    assert_eq!(reply.data.len(), 6);
    assert_eq!(client.mailbox().status().unwrap(), Status::NoData);
    node.shutdown().unwrap();
}

#[test]
fn touching_an_unmapped_region_is_a_segmentation_fault() {
    let node = InitNode::start(UrpcConfig::new()).unwrap();
    let vm = node.address_space().unwrap();
    let size = 5 * LARGE_PAGE_SIZE;
    let base = vm.alloc_region(size).unwrap();

    for page in (base..base + size).step_by(BASE_PAGE_SIZE) {
        vm.write_u64(page, page as u64).unwrap();
    }
    let last = base + size - BASE_PAGE_SIZE;
    assert_eq!(vm.read_u64(last).unwrap(), last as u64);

    vm.unmap(base).unwrap();
    assert_eq!(vm.write_u64(base, 1), Err(VmError::Segmentation { addr: base }));
    assert!(vm.halted());
    assert_eq!(vm.alloc_region(BASE_PAGE_SIZE), Err(VmError::Halted));
    node.shutdown().unwrap();
}
