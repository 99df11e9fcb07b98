/*
 * imap_sync.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Splintermail, an end-to-end encrypted email service.
 *
 * Splintermail is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Splintermail is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Splintermail.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Drives the IMAP up-connection state machine against a recording
//! transport: first-time sync, QRESYNC resume, uid-validity invalidation,
//! flag journalling, and pipeline discipline.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use splintermail_core::crypto::{Encrypter, Keypair};
use splintermail_core::error::ErrorKind;
use splintermail_core::maildir::name::{Flags, ImapName};
use splintermail_core::protocol::imap::{
    FetchResp, ImapCmd, ImapResp, Imaildir, OkCode, Status, TaggedCmd, UpConn,
};

const TEST_BITS: usize = 512;

#[derive(Default)]
struct MockConn {
    cmds: Mutex<Vec<TaggedCmd>>,
    released: AtomicBool,
    unselected: AtomicBool,
    synced: AtomicBool,
}

impl UpConn for MockConn {
    fn cmd(&self, cmd: TaggedCmd) {
        self.cmds.lock().unwrap().push(cmd);
    }
    fn release(&self, _err: Option<splintermail_core::Error>) {
        self.released.store(true, Ordering::SeqCst);
    }
    fn unselected(&self) {
        self.unselected.store(true, Ordering::SeqCst);
    }
    fn synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }
}

impl MockConn {
    fn take_cmds(&self) -> Vec<TaggedCmd> {
        std::mem::take(&mut *self.cmds.lock().unwrap())
    }
}

fn keypair(dir: &Path) -> Keypair {
    let path = dir.join("device.pem");
    if path.exists() {
        Keypair::load(&path).unwrap()
    } else {
        Keypair::generate(TEST_BITS, &path).unwrap()
    }
}

fn envelope_for(kp: &Keypair, plain: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut enc =
        Encrypter::new(&[(kp.fingerprint.as_slice(), kp.public_key())], &mut out).unwrap();
    enc.update(plain, &mut out).unwrap();
    enc.finish(&mut out).unwrap();
    out
}

fn tagged_ok(tag: &str) -> ImapResp {
    ImapResp::Tagged {
        tag: tag.to_string(),
        status: Status::Ok,
        text: "completed".to_string(),
    }
}

fn fetch_with_content(kp: &Keypair, uid: u32, modseq: u64, plain: &[u8]) -> ImapResp {
    ImapResp::Fetch(FetchResp {
        uid: Some(uid),
        flags: Some(Flags::default()),
        intdate: Some(1600000000),
        modseq: Some(modseq),
        content: Some(envelope_for(kp, plain)),
    })
}

#[test]
fn first_time_sync_downloads_everything() {
    let keydir = tempfile::tempdir().unwrap();
    let kp = keypair(keydir.path());
    let dir = tempfile::tempdir().unwrap();

    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    let conn = Arc::new(MockConn::default());
    let mut up = m.register_up(conn.clone()).unwrap();
    assert!(up.is_primary());
    assert!(up.selected());

    // first command: a plain SELECT (no qresync is possible yet)
    let cmds = conn.take_cmds();
    assert_eq!(cmds.len(), 1);
    assert_eq!(
        cmds[0].cmd,
        ImapCmd::Select {
            mailbox: "INBOX".to_string(),
            qresync: None
        }
    );

    up.resp(ImapResp::UntaggedOk {
        code: Some(OkCode::UidValidity(111)),
        text: String::new(),
    })
    .unwrap();
    up.resp(ImapResp::Exists(2)).unwrap();
    up.resp(tagged_ok("maildir_up1")).unwrap();

    // no known modseq: the driver enumerates with UID SEARCH
    let cmds = conn.take_cmds();
    assert_eq!(cmds.len(), 1);
    assert_eq!(cmds[0].cmd, ImapCmd::UidSearchAll);

    up.resp(ImapResp::Search(vec![4, 7])).unwrap();
    up.resp(tagged_ok("maildir_up2")).unwrap();

    let cmds = conn.take_cmds();
    assert_eq!(cmds.len(), 1);
    match &cmds[0].cmd {
        ImapCmd::UidFetch(set) => assert_eq!(set.to_string(), "4,7"),
        other => panic!("expected fetch, got {:?}", other),
    }

    up.resp(fetch_with_content(&kp, 4, 41, b"message four")).unwrap();
    up.resp(fetch_with_content(&kp, 7, 42, b"message seven")).unwrap();
    assert!(!conn.synced.load(Ordering::SeqCst));
    up.resp(tagged_ok("maildir_up3")).unwrap();

    // everything downloaded: synced fired, himodseq persisted
    assert!(conn.synced.load(Ordering::SeqCst));
    assert!(up.synced());
    assert_eq!(m.message_count(), 2);
    assert_eq!(m.himodseq_up(), 42);
    assert_eq!(m.uidvld(), 111);

    // both messages landed in cur/ under parseable names with plaintext
    let mut seen_uids = Vec::new();
    for entry in std::fs::read_dir(dir.path().join("cur")).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().to_string();
        let parsed = ImapName::parse(&name).unwrap();
        seen_uids.push(parsed.uid);
        let content = std::fs::read(dir.path().join("cur").join(&name)).unwrap();
        assert!(content.starts_with(b"message"));
    }
    seen_uids.sort_unstable();
    assert_eq!(seen_uids, vec![4, 7]);

    // clean close
    up.unselect();
    let cmds = conn.take_cmds();
    assert_eq!(cmds[0].cmd, ImapCmd::Close);
    up.resp(tagged_ok("maildir_up4")).unwrap();
    assert!(conn.unselected.load(Ordering::SeqCst));

    drop(up);
    assert!(conn.released.load(Ordering::SeqCst));
}

#[test]
fn qresync_resume_skips_download() {
    let keydir = tempfile::tempdir().unwrap();
    let kp = keypair(keydir.path());
    let dir = tempfile::tempdir().unwrap();

    // first session downloads one message
    {
        let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
        let conn = Arc::new(MockConn::default());
        let mut up = m.register_up(conn.clone()).unwrap();
        conn.take_cmds();
        up.resp(ImapResp::UntaggedOk {
            code: Some(OkCode::UidValidity(111)),
            text: String::new(),
        })
        .unwrap();
        up.resp(tagged_ok("maildir_up1")).unwrap();
        up.resp(ImapResp::Search(vec![1])).unwrap();
        up.resp(tagged_ok("maildir_up2")).unwrap();
        up.resp(fetch_with_content(&kp, 1, 10, b"hello")).unwrap();
        up.resp(tagged_ok("maildir_up3")).unwrap();
        assert!(conn.synced.load(Ordering::SeqCst));
    }

    // second session resumes with QRESYNC and is synced without fetching
    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    assert_eq!(m.message_count(), 1);
    let conn = Arc::new(MockConn::default());
    let mut up = m.register_up(conn.clone()).unwrap();
    let cmds = conn.take_cmds();
    assert_eq!(
        cmds[0].cmd,
        ImapCmd::Select {
            mailbox: "INBOX".to_string(),
            qresync: Some((111, 10))
        }
    );
    up.resp(ImapResp::UntaggedOk {
        code: Some(OkCode::UidValidity(111)),
        text: String::new(),
    })
    .unwrap();
    up.resp(ImapResp::UntaggedOk {
        code: Some(OkCode::HighestModSeq(10)),
        text: String::new(),
    })
    .unwrap();
    up.resp(tagged_ok("maildir_up1")).unwrap();
    assert!(conn.synced.load(Ordering::SeqCst));
    assert!(conn.take_cmds().is_empty());
}

#[test]
fn uidvalidity_change_drops_everything() {
    let keydir = tempfile::tempdir().unwrap();
    let kp = keypair(keydir.path());
    let dir = tempfile::tempdir().unwrap();

    {
        let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
        let conn = Arc::new(MockConn::default());
        let mut up = m.register_up(conn.clone()).unwrap();
        conn.take_cmds();
        up.resp(ImapResp::UntaggedOk {
            code: Some(OkCode::UidValidity(111)),
            text: String::new(),
        })
        .unwrap();
        up.resp(tagged_ok("maildir_up1")).unwrap();
        up.resp(ImapResp::Search(vec![1])).unwrap();
        up.resp(tagged_ok("maildir_up2")).unwrap();
        up.resp(fetch_with_content(&kp, 1, 10, b"old world")).unwrap();
        up.resp(tagged_ok("maildir_up3")).unwrap();
        assert_eq!(m.message_count(), 1);
    }

    // the server's uid-validity moved: all local state is invalid
    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    let conn = Arc::new(MockConn::default());
    let mut up = m.register_up(conn.clone()).unwrap();
    conn.take_cmds();
    up.resp(ImapResp::UntaggedOk {
        code: Some(OkCode::UidValidity(222)),
        text: String::new(),
    })
    .unwrap();

    assert_eq!(m.message_count(), 0);
    assert_eq!(m.himodseq_up(), 0);
    assert_eq!(m.uidvld(), 222);
    let cur_files = std::fs::read_dir(dir.path().join("cur")).unwrap().count();
    assert_eq!(cur_files, 0);

    // and the sync restarts from an explicit enumeration
    up.resp(tagged_ok("maildir_up1")).unwrap();
    let cmds = conn.take_cmds();
    assert_eq!(cmds[0].cmd, ImapCmd::UidSearchAll);
}

#[test]
fn flag_updates_are_journalled() {
    let keydir = tempfile::tempdir().unwrap();
    let kp = keypair(keydir.path());
    let dir = tempfile::tempdir().unwrap();

    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    let conn = Arc::new(MockConn::default());
    let mut up = m.register_up(conn.clone()).unwrap();
    conn.take_cmds();
    up.resp(ImapResp::UntaggedOk {
        code: Some(OkCode::UidValidity(111)),
        text: String::new(),
    })
    .unwrap();
    up.resp(tagged_ok("maildir_up1")).unwrap();
    up.resp(ImapResp::Search(vec![3])).unwrap();
    up.resp(tagged_ok("maildir_up2")).unwrap();
    up.resp(fetch_with_content(&kp, 3, 20, b"flagged later")).unwrap();
    up.resp(tagged_ok("maildir_up3")).unwrap();

    // a later flags-only fetch advances the served modseq
    up.resp(ImapResp::Fetch(FetchResp {
        uid: Some(3),
        flags: Some(Flags {
            seen: true,
            ..Default::default()
        }),
        intdate: None,
        modseq: Some(21),
        content: None,
    }))
    .unwrap();
    assert_eq!(m.himodseq_dn(), 21);

    // the update survives a reopen via the log
    drop(up);
    drop(m);
    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    assert_eq!(m.himodseq_dn(), 21);
    assert_eq!(m.message_count(), 1);
}

#[test]
fn tagged_response_must_match_pipeline_head() {
    let keydir = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    let conn = Arc::new(MockConn::default());
    let mut up = m.register_up(conn.clone()).unwrap();
    conn.take_cmds();

    let err = up.resp(tagged_ok("maildir_up99")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Response);
}

#[test]
fn failed_maildir_rejects_registration() {
    let keydir = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    let first = Arc::new(MockConn::default());
    let _up = m.register_up(first.clone()).unwrap();

    m.fail(Some(splintermail_core::Error::new(
        ErrorKind::Conn,
        "upstream died",
    )));
    assert!(first.released.load(Ordering::SeqCst));

    let second = Arc::new(MockConn::default());
    let err = m.register_up(second).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dead);
}

#[test]
fn replica_registration_is_not_primary() {
    let keydir = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let m = Imaildir::init(dir.path(), "INBOX", keypair(keydir.path())).unwrap();
    let primary_conn = Arc::new(MockConn::default());
    let _primary = m.register_up(primary_conn.clone()).unwrap();
    assert_eq!(primary_conn.take_cmds().len(), 1);

    let replica_conn = Arc::new(MockConn::default());
    let replica = m.register_up(replica_conn.clone()).unwrap();
    assert!(!replica.is_primary());
    // replicas do not drive the sync loop
    assert!(replica_conn.take_cmds().is_empty());
}
