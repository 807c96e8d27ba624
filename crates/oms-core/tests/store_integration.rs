//! Inventory behaviour against an in-memory SQLite database

use chrono::{Duration, Utc};

use oms_core::models::{
    CmdType, GroupMode, InstanceStatus, JobStatus, JobType, NewHost, NewJob, NewTunnel, Page,
    Preload, TunnelMode,
};
use oms_core::{Inventory, SqliteStore, StoreError};

fn store() -> SqliteStore {
    SqliteStore::in_memory().expect("in-memory store")
}

fn host(name: &str, addr: &str) -> NewHost {
    NewHost {
        name: name.to_string(),
        addr: addr.to_string(),
        password: "secret".to_string(),
        ..Default::default()
    }
}

fn job(host_id: i64) -> NewJob {
    NewJob {
        name: "uptime".to_string(),
        job_type: JobType::Cron,
        spec: "*/1 * * * *".to_string(),
        cmd: "uptime".to_string(),
        cmd_type: CmdType::Cmd,
        cmd_id: None,
        sudo: false,
        host_id,
    }
}

#[test]
fn test_insert_host_with_tags_and_preload() {
    let store = store();
    let web = store.insert_tag("web").unwrap();
    let db = store.insert_tag("db").unwrap();

    let mut h = host("web-1", "10.0.0.1");
    h.tag_ids = vec![web.id, db.id];
    let created = store.insert_host(&h).unwrap();
    assert_eq!(created.port, 22);
    assert_eq!(created.tags.len(), 2);

    let loaded = store.get_host(created.id, Preload::ALL).unwrap();
    assert_eq!(loaded.tags, vec![web, db]);
    assert!(loaded.tunnels.is_empty());
}

#[test]
fn test_invalid_host_is_rejected_and_not_inserted() {
    let store = store();
    let mut h = host("bad", "10.0.0.1");
    h.port = Some(0);
    let err = store.insert_host(&h).unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    assert!(store.list_hosts(Preload::NONE).unwrap().is_empty());
}

#[test]
fn test_duplicate_tag_is_conflict() {
    let store = store();
    store.insert_tag("web").unwrap();
    assert!(matches!(
        store.insert_tag("web").unwrap_err(),
        StoreError::Conflict(_)
    ));
}

#[test]
fn test_host_delete_cascades_to_tunnels_and_jobs() {
    let store = store();
    let h = store.insert_host(&host("a", "10.0.0.1")).unwrap();
    let t = store
        .insert_tunnel(&NewTunnel {
            mode: TunnelMode::Local,
            source: "127.0.0.1:80".into(),
            destination: "0.0.0.0:9000".into(),
            host_id: h.id,
        })
        .unwrap();
    let j = store.insert_job(&job(h.id)).unwrap();

    store.delete_host(h.id).unwrap();
    assert!(store.get_tunnel(t.id).unwrap_err().is_not_found());
    assert!(store.get_job(j.id).unwrap_err().is_not_found());
}

#[test]
fn test_lookup_by_glob_regex_addr_and_group() {
    let store = store();
    let group = store.insert_group("static", GroupMode::Static, "").unwrap();
    let mut a = host("a", "10.0.1.5");
    a.group_id = Some(group.id);
    store.insert_host(&a).unwrap();
    store.insert_host(&host("b", "10.0.2.5")).unwrap();
    store.insert_host(&host("c", "192.168.1.1")).unwrap();

    let glob: Vec<_> = store
        .hosts_by_glob("10.0.*")
        .unwrap()
        .into_iter()
        .map(|h| h.name)
        .collect();
    assert_eq!(glob, vec!["a", "b"]);

    let re = store.hosts_by_regex(r"^192\.").unwrap();
    assert_eq!(re.len(), 1);
    assert_eq!(re[0].name, "c");

    assert_eq!(store.hosts_by_addr("10.0.2.5").unwrap().len(), 1);
    assert!(store.hosts_by_addr("10.0.2").unwrap().is_empty());

    let members = store.hosts_by_group(group.id).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name, "a");

    assert!(matches!(
        store.hosts_by_regex("(").unwrap_err(),
        StoreError::Pattern(_)
    ));
}

#[test]
fn test_status_update_reports_change() {
    let store = store();
    let h = store.insert_host(&host("a", "10.0.0.1")).unwrap();
    assert!(store.update_host_status(h.id, true).unwrap());
    assert!(!store.update_host_status(h.id, true).unwrap());
    assert!(store.get_host(h.id, Preload::NONE).unwrap().status);
    assert!(store.update_host_status(999, true).unwrap_err().is_not_found());
}

#[test]
fn test_job_status_roundtrip_and_running_query() {
    let store = store();
    let h = store.insert_host(&host("a", "10.0.0.1")).unwrap();
    let j = store.insert_job(&job(h.id)).unwrap();
    assert_eq!(j.status, JobStatus::Ready);

    store.update_job_status(j.id, JobStatus::Running).unwrap();
    let running: Vec<_> = store
        .list_jobs()
        .unwrap()
        .into_iter()
        .filter(|j| j.status == JobStatus::Running)
        .collect();
    assert_eq!(running.len(), 1);
}

#[test]
fn test_guarded_status_write_keeps_stop() {
    let store = store();
    let h = store.insert_host(&host("a", "10.0.0.1")).unwrap();
    let j = store.insert_job(&job(h.id)).unwrap();

    assert!(store.update_job_status_unless_stopped(j.id, JobStatus::Running).unwrap());
    store.update_job_status(j.id, JobStatus::Stop).unwrap();
    assert!(!store.update_job_status_unless_stopped(j.id, JobStatus::Done).unwrap());
    assert_eq!(store.get_job(j.id).unwrap().status, JobStatus::Stop);

    let err = store.update_job_status_unless_stopped(999, JobStatus::Done).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_job_sudo_flag_persists() {
    let store = store();
    let h = store.insert_host(&host("a", "10.0.0.1")).unwrap();
    let mut new = job(h.id);
    new.sudo = true;
    let j = store.insert_job(&new).unwrap();
    assert!(j.sudo);
    assert!(store.get_job(j.id).unwrap().sudo);

    new.sudo = false;
    store.update_job(j.id, &new).unwrap();
    assert!(!store.get_job(j.id).unwrap().sudo);
}

#[test]
fn test_instances_paginate_and_clear() {
    let store = store();
    let h = store.insert_host(&host("a", "10.0.0.1")).unwrap();
    let j = store.insert_job(&job(h.id)).unwrap();

    let old = store
        .insert_instance(j.id, Utc::now() - Duration::days(10))
        .unwrap();
    store.finish_instance(old.id, InstanceStatus::Done).unwrap();
    for _ in 0..3 {
        store.insert_instance(j.id, Utc::now()).unwrap();
    }

    let page = store
        .list_instances(
            Some(j.id),
            Page {
                page_num: 1,
                page_size: 2,
            },
        )
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.data.len(), 2);

    let removed = store
        .clear_instances(Utc::now() - Duration::days(1), None)
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.list_instances(None, Page::default()).unwrap().total, 3);
}

#[test]
fn test_command_history_counts_and_search() {
    let store = store();
    store.insert_or_update_command_history("ls -la").unwrap();
    store.insert_or_update_command_history("ls -la").unwrap();
    let third = store.insert_or_update_command_history("ls -la").unwrap();
    assert_eq!(third.times, 3);
    store.insert_or_update_command_history("lsblk").unwrap();
    store.insert_or_update_command_history("df -h").unwrap();

    let hits = store.search_command_history("ls ", 0).unwrap();
    let cmds: Vec<_> = hits.iter().map(|h| h.cmd.as_str()).collect();
    assert_eq!(cmds, vec!["ls -la", "lsblk"]);

    let all = store.search_command_history("", 2).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].cmd, "ls -la");
}

#[test]
fn test_quickly_command_name_unique() {
    let store = store();
    store.insert_quickly_command("disk", "df -h").unwrap();
    assert!(matches!(
        store.insert_quickly_command("disk", "du -sh").unwrap_err(),
        StoreError::Conflict(_)
    ));
}

#[test]
fn test_page_hosts_defaults() {
    let store = store();
    for i in 0..25 {
        store
            .insert_host(&host(&format!("h{i}"), &format!("10.0.0.{i}")))
            .unwrap();
    }
    let first = store.page_hosts(Page::default()).unwrap();
    assert_eq!(first.total, 25);
    assert_eq!(first.data.len(), 20);
    let second = store
        .page_hosts(Page {
            page_num: 2,
            page_size: 20,
        })
        .unwrap();
    assert_eq!(second.data.len(), 5);
}

#[test]
fn test_open_file_backed_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("oms.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.insert_tag("persisted").unwrap();
    }
    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.list_tags().unwrap()[0].name, "persisted");
}

#[test]
fn test_open_adds_sudo_to_existing_job_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oms.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE job (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                spec TEXT NOT NULL DEFAULT '',
                cmd TEXT NOT NULL DEFAULT '',
                cmd_type TEXT NOT NULL DEFAULT 'cmd',
                cmd_id INTEGER,
                status TEXT NOT NULL DEFAULT 'ready',
                host_id INTEGER NOT NULL
            );
            INSERT INTO job (name, type, spec, cmd, host_id) VALUES ('old', 'cron', '@daily', 'date', 1);",
        )
        .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let jobs = store.list_jobs().unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(!jobs[0].sudo);

    drop(store);
    SqliteStore::open(&path).unwrap();
}
