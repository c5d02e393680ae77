use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::modules::address::{mailboxes, parse_address_list};
use crate::modules::common::prompt::ScriptedPrompter;
use crate::modules::compose::{ComposeOp, ScriptedOps};
use crate::modules::crypto::{CryptoGateway, SecurityFlags, APPLICATION_PGP, SEC_OPPENC};
use crate::modules::envelope::Envelope;
use crate::modules::format::Template;
use crate::modules::mailbox::{MailStore, MboxStore};
use crate::modules::send::background::BackgroundRegistry;
use crate::modules::send::{
    begin_reply, resolve_oppenc, resume_backgrounded, send_message, CurrentMessage, SendContext,
    SendEnvironment, SendOutcome, SEND_BACKGROUND_EDIT, SEND_BATCH,
};
use crate::modules::settings::cli::Settings;
use crate::modules::settings::quad::QuadOption;
use crate::modules::settings::scope::SessionOptions;

fn options(dir: &Path) -> SessionOptions {
    let mut opts = SessionOptions::from_settings(&Settings::new_for_test());
    opts.tmpdir = dir.to_path_buf();
    opts.folder = dir.to_path_buf();
    opts.user = "me@example.com".to_string();
    opts.from = Some("me@example.com".to_string());
    opts.copy = QuadOption::No;
    opts
}

/// A sendmail stand-in that records the message and its arguments.
fn fake_mta(dir: &Path, opts: &mut SessionOptions) -> (std::path::PathBuf, std::path::PathBuf) {
    let out = dir.join("mta-message");
    let args = dir.join("mta-args");
    opts.sendmail = format!(
        "/bin/sh -c 'cat > {}; printf %s \"$*\" > {}' mta",
        out.display(),
        args.display()
    );
    (out, args)
}

#[tokio::test]
async fn batch_send_delivers_one_copy_and_no_fcc() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path());
    let (out, args) = fake_mta(dir.path(), &mut opts);

    let mut sctx = SendContext::new(SEND_BATCH, opts).unwrap();
    sctx.msg.envelope.to = parse_address_list("alice@example.com").unwrap();
    sctx.msg.envelope.set_subject("hi", "^re:");
    sctx.write_draft_text("hello\n").unwrap();

    let gateway = CryptoGateway::from_options(&sctx.options).unwrap();
    let environment = SendEnvironment::empty();
    let mut prompter = crate::modules::common::prompt::BatchPrompter;
    let mut ops = ScriptedOps::new([]);

    let outcome = send_message(
        sctx,
        &gateway,
        &mut prompter,
        &mut ops,
        None,
        None,
        &environment,
    )
    .await
    .unwrap();
    assert_eq!(outcome, SendOutcome::Sent);

    let recorded_args = fs::read_to_string(&args).unwrap();
    assert!(recorded_args.contains("alice@example.com"));
    let message = fs::read_to_string(&out).unwrap();
    let body_start = message.split_once("\n\n").map(|(_, b)| b).unwrap_or("");
    assert!(body_start.starts_with("hello"));
    assert!(message.contains("Subject: hi"));
    // $copy=no: no Fcc record anywhere under the folder.
    assert!(!dir.path().join("sent").exists());
}

#[test]
fn reply_to_multiple_parents_clears_threading() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());

    let mut env_a = Envelope::new();
    env_a.from = parse_address_list("a-author@example.org").unwrap();
    env_a.message_id = Some("<A@example.org>".to_string());
    env_a.set_subject("the plan", &opts.reply_regexp);
    let mut env_b = Envelope::new();
    env_b.from = parse_address_list("b-author@example.org, me@example.com").unwrap();
    env_b.message_id = Some("<B@example.org>".to_string());

    let originals = vec![
        CurrentMessage {
            envelope: env_a,
            raw: Vec::new(),
            security: SecurityFlags::default(),
        },
        CurrentMessage {
            envelope: env_b,
            raw: Vec::new(),
            security: SecurityFlags::default(),
        },
    ];
    let mut prompter = ScriptedPrompter::new();
    let sctx = begin_reply(0, opts, originals, None, &mut prompter).unwrap();

    assert_eq!(sctx.msg.envelope.subject.as_deref(), Some("Re: the plan"));
    assert!(sctx.msg.envelope.in_reply_to.is_empty());
    assert!(sctx.msg.envelope.references.is_empty());
    let to = mailboxes(&sctx.msg.envelope.to);
    assert!(to.contains(&"a-author@example.org".to_string()));
    assert!(to.contains(&"b-author@example.org".to_string()));
    assert!(!to.contains(&"me@example.com".to_string()));
    assert_eq!(
        sctx.tagged_message_ids,
        vec!["<A@example.org>", "<B@example.org>"]
    );
}

#[tokio::test]
async fn opportunistic_encrypt_declines_on_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());

    // A key lookup that only knows alice.
    let script = dir.path().join("listkeys.sh");
    fs::write(
        &script,
        "#!/bin/sh\n\
case \"$1\" in\n\
*alice*)\n\
  printf 'pub:f:4096:1:AAAA1111BBBB2222:1600000000:::-:::scESC::::::23::0:\\n'\n\
  printf 'uid:f::::1600000000::HASH::alice <alice@example.com>::::::::::0:\\n'\n\
  ;;\n\
*) exit 2 ;;\n\
esac\n",
    )
    .unwrap();
    let mut perm = fs::metadata(&script).unwrap().permissions();
    perm.set_mode(0o755);
    fs::set_permissions(&script, perm).unwrap();

    let mut gateway = CryptoGateway::from_options(&opts).unwrap();
    gateway.pgp.list_keys_command =
        Template::parse(&format!("{} %c", script.display())).unwrap();

    let mut sctx = SendContext::new(0, opts).unwrap();
    sctx.msg.envelope.to =
        parse_address_list("alice@example.com, stranger@example.net").unwrap();
    sctx.msg.security = SecurityFlags(SEC_OPPENC | APPLICATION_PGP);

    let keys = resolve_oppenc(&mut sctx, &gateway).await;
    assert!(keys.is_empty());
    assert!(!sctx.msg.security.encrypt());
    assert!(sctx.msg.security.intersects(SEC_OPPENC));
    assert!(sctx.msg.security.intersects(APPLICATION_PGP));

    // With only the known recipient, the decision flips to encrypt.
    sctx.msg.envelope.to = parse_address_list("alice@example.com").unwrap();
    let keys = resolve_oppenc(&mut sctx, &gateway).await;
    assert_eq!(keys, vec!["AAAA1111BBBB2222"]);
    assert!(sctx.msg.security.encrypt());
}

#[tokio::test]
async fn background_reply_marks_original_by_message_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path());
    let (out, _args) = fake_mta(dir.path(), &mut opts);
    opts.background_edit = true;
    opts.include = QuadOption::Yes;

    // The originating mailbox, which gets "re-sorted" while the
    // editor runs.
    let mailbox_path = dir.path().join("inbox");
    let store = MboxStore::new(&mailbox_path);
    store
        .append(
            b"From: author@example.org\n\
To: me@example.com\n\
Message-ID: <orig@example.org>\n\
Subject: question\n\
\n\
what about it?\n",
            "author@example.org",
        )
        .unwrap();

    let original_raw = store.find_by_message_id("<orig@example.org>").unwrap().unwrap();
    let parsed = mail_parser::MessageParser::default()
        .parse(&original_raw[..])
        .unwrap();
    let current = CurrentMessage {
        envelope: Envelope::from_parsed(&parsed),
        raw: original_raw,
        security: SecurityFlags::default(),
    };

    let mut prompter = ScriptedPrompter::new();
    let mut sctx = begin_reply(
        SEND_BACKGROUND_EDIT,
        opts.clone(),
        vec![current],
        Some(mailbox_path.clone()),
        &mut prompter,
    )
    .unwrap();
    sctx.options.editor = "sh -c 'echo follow-up >> \"$0\"'".to_string();

    let gateway = CryptoGateway::from_options(&sctx.options).unwrap();
    let environment = SendEnvironment::empty();
    let (registry, mut events) = BackgroundRegistry::new();
    let mut ops = ScriptedOps::new([ComposeOp::Send]);

    let outcome = send_message(
        sctx,
        &gateway,
        &mut prompter,
        &mut ops,
        Some(&registry),
        None,
        &environment,
    )
    .await
    .unwrap();
    assert_eq!(outcome, SendOutcome::Backgrounded);

    // Index churn during the wait: another message lands in front.
    store
        .append(
            b"From: noise@example.org\nMessage-ID: <noise@example.org>\nSubject: noise\n\nx\n",
            "noise@example.org",
        )
        .unwrap();

    let pid = events.recv().await.unwrap();
    let resumed = registry.reap(pid).unwrap();
    assert!(resumed.cur.is_none());

    let outcome = resume_backgrounded(
        resumed,
        &mut opts,
        &gateway,
        &mut prompter,
        &mut ops,
        Some(&registry),
        None,
        &environment,
    )
    .await
    .unwrap();
    assert_eq!(outcome, SendOutcome::Sent);

    let sent = fs::read_to_string(&out).unwrap();
    assert!(sent.contains("follow-up"));
    assert!(sent.contains("In-Reply-To: <orig@example.org>"));

    // The replied flag landed on the right message despite the churn.
    let original = store.find_by_message_id("<orig@example.org>").unwrap().unwrap();
    assert!(String::from_utf8_lossy(&original).contains("X-Status: A"));
    let noise = store.find_by_message_id("<noise@example.org>").unwrap().unwrap();
    assert!(!String::from_utf8_lossy(&noise).contains("X-Status"));
}
