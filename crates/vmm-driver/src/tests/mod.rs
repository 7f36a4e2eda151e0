//! Crate-level integration and BDD tests.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::DriverChannel;
use crate::dispatcher::Dispatcher;
use crate::facade::VmmDriver;
use crate::housekeeping::Housekeeper;
use crate::ids::{DriverId, VmId};
use crate::store::{MemoryVmStore, VmStatus};


#[test]
fn end_to_end_deploy_through_driver_pipes() {
    let store = Arc::new(MemoryVmStore::new());
    store.insert(VmId::new(7), VmStatus::Pending);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&store)));
    let (driver_stdout, mut replies) = io::pipe().expect("pipe");
    let (commands, driver_stdin) = io::pipe().expect("pipe");
    let (channel, reader) = DriverChannel::open(
        DriverId::new("kvm"),
        driver_stdout,
        driver_stdin,
        Arc::clone(&dispatcher),
    )
    .expect("channel opens");
    let housekeeper = Housekeeper::new(Duration::from_millis(20))
        .start(Arc::clone(&dispatcher))
        .expect("housekeeper starts");
    let driver = VmmDriver::new(channel, Arc::clone(&dispatcher), Duration::from_secs(90));

    driver.deploy(VmId::new(7), "<VM/>").expect("deploy accepted");
    replies
        .write_all(b"LOG 7 I defining domain\nDEPLOY 7 SUCCESS one-7\n")
        .expect("driver replies");
    drop(replies);
    reader.join().expect("reader exits cleanly");
    housekeeper.join().expect("housekeeper stops cleanly");
    drop(driver);

    let snapshot = store.snapshot(VmId::new(7)).expect("VM exists");
    assert_eq!(snapshot.status(), VmStatus::Running);
    assert_eq!(snapshot.deploy_id(), Some("one-7"));
    assert!(dispatcher.registry().is_empty());

    let sent = io::read_to_string(commands).expect("commands readable");
    assert_eq!(sent, "DEPLOY 7 <VM/>\n");
}
