//! Single-node cluster behavior and participant-side TCC state machine.

use googletest::prelude::*;
use rstest::rstest;

use carmine_common::config::ServerConfig;
use carmine_resp::{Engine, Reply, Session, cmd_line};

use crate::Cluster;
use crate::tcc::TxStatus;

fn single_node() -> Cluster {
    let config = ServerConfig {
        self_addr: "127.0.0.1:16399".to_owned(),
        buckets: 16,
        ..ServerConfig::default()
    };
    Cluster::new(&config).expect("single-node cluster must start")
}

fn exec(cluster: &Cluster, session: &mut Session, parts: &[&str]) -> Reply {
    cluster.exec(session, cmd_line(parts))
}

#[rstest]
fn cluster_requires_self_address() {
    let config = ServerConfig::default();
    assert_that!(Cluster::new(&config).is_err(), eq(true));
}

#[rstest]
fn single_node_serves_ordinary_commands_locally() {
    let cluster = single_node();
    let mut session = Session::default();
    assert_that!(exec(&cluster, &mut session, &["SET", "name", "jack"]), eq(&Reply::ok()));
    assert_that!(
        exec(&cluster, &mut session, &["GET", "name"]),
        eq(&Reply::Bulk(b"jack".to_vec()))
    );
    assert_that!(exec(&cluster, &mut session, &["PING"]), eq(&Reply::pong()));
}

#[rstest]
fn multi_key_commands_fast_path_on_one_owner() {
    let cluster = single_node();
    let mut session = Session::default();
    assert_that!(
        exec(&cluster, &mut session, &["MSET", "a", "1", "b", "2"]),
        eq(&Reply::ok())
    );
    assert_that!(exec(&cluster, &mut session, &["DEL", "a", "b"]), eq(&Reply::Integer(2)));
    assert_that!(exec(&cluster, &mut session, &["EXISTS", "a", "b"]), eq(&Reply::Integer(0)));
}

#[rstest]
fn unknown_command_is_rejected_in_cluster_mode() {
    let cluster = single_node();
    let mut session = Session::default();
    assert_that!(exec(&cluster, &mut session, &["BOGUS", "k"]).is_error(), eq(true));
}

#[rstest]
fn prepare_commit_applies_the_command() {
    let cluster = single_node();
    let mut session = Session::default();
    assert_that!(
        exec(&cluster, &mut session, &["PREPARE", "71", "SET", "k", "v"]),
        eq(&Reply::ok())
    );
    let reply = exec(&cluster, &mut session, &["COMMIT", "71"]);
    assert_that!(reply.is_error(), eq(false));
    assert_that!(
        exec(&cluster, &mut session, &["GET", "k"]),
        eq(&Reply::Bulk(b"v".to_vec()))
    );
}

#[rstest]
fn prepare_rollback_restores_previous_state() {
    let cluster = single_node();
    let mut session = Session::default();
    let _ = exec(&cluster, &mut session, &["SET", "k", "before"]);
    assert_that!(
        exec(&cluster, &mut session, &["PREPARE", "72", "SET", "k", "after"]),
        eq(&Reply::ok())
    );
    assert_that!(
        exec(&cluster, &mut session, &["ROLLBACK", "72"]),
        eq(&Reply::Integer(1))
    );
    assert_that!(
        exec(&cluster, &mut session, &["GET", "k"]),
        eq(&Reply::Bulk(b"before".to_vec()))
    );
    // A commit after rollback must refuse.
    assert_that!(exec(&cluster, &mut session, &["COMMIT", "72"]).is_error(), eq(true));
}

#[rstest]
fn commit_of_unknown_transaction_is_zero() {
    let cluster = single_node();
    let mut session = Session::default();
    assert_that!(exec(&cluster, &mut session, &["COMMIT", "999"]), eq(&Reply::Integer(0)));
    assert_that!(exec(&cluster, &mut session, &["ROLLBACK", "999"]), eq(&Reply::Integer(0)));
}

#[rstest]
fn msetnx_prepare_hook_rejects_existing_keys() {
    let cluster = single_node();
    let mut session = Session::default();
    let _ = exec(&cluster, &mut session, &["SET", "taken", "x"]);
    let reply = exec(
        &cluster,
        &mut session,
        &["PREPARE", "73", "MSETNX", "taken", "1", "fresh", "2"],
    );
    assert_that!(reply.is_error(), eq(true));
    let _ = exec(&cluster, &mut session, &["ROLLBACK", "73"]);
    assert_that!(exec(&cluster, &mut session, &["EXISTS", "fresh"]), eq(&Reply::Integer(0)));
}

#[rstest]
fn prepared_transaction_auto_rolls_back_after_max_lock_time() {
    let cluster = single_node();
    let mut session = Session::default();
    let _ = exec(&cluster, &mut session, &["SET", "k", "v"]);
    assert_that!(
        exec(&cluster, &mut session, &["PREPARE", "74", "DEL", "k"]),
        eq(&Reply::ok())
    );
    let tx = cluster
        .transactions
        .read()
        .expect("transaction table readable")
        .get("74")
        .cloned()
        .expect("transaction registered");
    assert_that!(tx.status(), eq(TxStatus::Prepared));

    // The wheel fires at max lock time (3s); leave slack for the tick.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(6);
    while tx.status() == TxStatus::Prepared && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    assert_that!(tx.status(), eq(TxStatus::RolledBack));
    // Locks were released and the key survived the aborted DEL.
    assert_that!(
        exec(&cluster, &mut session, &["GET", "k"]),
        eq(&Reply::Bulk(b"v".to_vec()))
    );
}

#[rstest]
fn watch_and_exec_work_against_the_local_node() {
    let cluster = single_node();
    let mut session = Session::default();
    let _ = exec(&cluster, &mut session, &["SET", "k", "5"]);
    let _ = exec(&cluster, &mut session, &["WATCH", "k"]);
    let _ = exec(&cluster, &mut session, &["MULTI"]);
    let _ = exec(&cluster, &mut session, &["INCR", "k"]);
    assert_that!(
        exec(&cluster, &mut session, &["EXEC"]),
        eq(&Reply::Array(vec![Reply::Integer(6)]))
    );
}
