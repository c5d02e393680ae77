use mimalloc::MiMalloc;
use modules::{
    common::prompt::{BatchPrompter, Prompter, StdPrompter},
    compose::ops::StdOpSource,
    compose::{OpSource, ScriptedOps},
    crypto::autocrypt::{AutocryptDb, JsonAutocryptStore},
    crypto::CryptoGateway,
    error::{code::ErrorCode, MailForgeResult},
    logger,
    send::background::BackgroundRegistry,
    send::{
        resume_backgrounded, send_message, SendContext, SendEnvironment, SendOutcome,
        SEND_BACKGROUND_EDIT, SEND_BATCH, SEND_CHECK_POSTPONED, SEND_POSTPONED,
    },
    settings::cli::SETTINGS,
    settings::scope::SessionOptions,
};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

mod modules;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    logger::initialize_logging();
    info!("Starting mailforge {}", mailforge_version!());

    std::process::exit(match run().await {
        Ok(SendOutcome::Sent) | Ok(SendOutcome::Postponed) => 0,
        Ok(SendOutcome::Aborted) => 2,
        Ok(SendOutcome::Backgrounded) => 0,
        Err(e) => {
            error!("{}", e.oneline());
            eprintln!("mailforge: {}", e.oneline());
            e.exit_code()
        }
    });
}

async fn run() -> MailForgeResult<SendOutcome> {
    let mut options = SessionOptions::from_settings(&SETTINGS);
    let gateway = CryptoGateway::from_options(&options)?;
    let environment = SendEnvironment::from_settings(&SETTINGS);
    let autocrypt_db: Option<JsonAutocryptStore> = if SETTINGS.mailforge_autocrypt {
        Some(JsonAutocryptStore::open(&SETTINGS.mailforge_autocrypt_dir)?)
    } else {
        None
    };
    let autocrypt_ref = autocrypt_db.as_ref().map(|db| db as &dyn AutocryptDb);

    let mut flags = 0u32;
    if SETTINGS.batch {
        flags |= SEND_BATCH;
    } else {
        flags |= SEND_CHECK_POSTPONED;
        if options.background_edit {
            flags |= SEND_BACKGROUND_EDIT;
        }
    }
    if SETTINGS.resume_postponed {
        flags |= SEND_POSTPONED;
    }

    let mut sctx = SendContext::new(flags, options.clone())?;

    // Recipients and subject from the command line.
    if !SETTINGS.recipients.is_empty() {
        let joined = SETTINGS.recipients.join(", ");
        sctx.msg.envelope.to = modules::address::parse_address_list(&joined)?;
    }
    if let Some(subject) = &SETTINGS.subject {
        let regexp = sctx.options.reply_regexp.clone();
        sctx.msg.envelope.set_subject(subject, &regexp);
    }

    // Initial body: a draft file, an include file, stdin in batch
    // mode, or empty.
    if let Some(draft_file) = &SETTINGS.draft_file {
        let raw = std::fs::read(draft_file).map_err(|e| {
            crate::raise_error!(
                format!("Cannot read draft file {:?}: {}", draft_file, e),
                ErrorCode::FileOpenFailed
            )
        })?;
        let draft = modules::message::DraftMessage::from_raw(&raw, &sctx.options.tmpdir)?;
        let recipients = sctx.msg.envelope.to.clone();
        let subject = sctx.msg.envelope.subject.clone();
        sctx.adopt_draft(draft)?;
        if !recipients.is_empty() {
            sctx.msg.envelope.to = recipients;
        }
        if let Some(subject) = subject {
            let regexp = sctx.options.reply_regexp.clone();
            sctx.msg.envelope.set_subject(&subject, &regexp);
        }
    } else if let Some(include) = &SETTINGS.include {
        let text = std::fs::read_to_string(include).map_err(|e| {
            crate::raise_error!(
                format!("Cannot read {:?}: {}", include, e),
                ErrorCode::FileOpenFailed
            )
        })?;
        sctx.write_draft_text(&text)?;
    } else if SETTINGS.batch {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .map_err(|e| {
                crate::raise_error!(
                    format!("Cannot read message from stdin: {}", e),
                    ErrorCode::FileOpenFailed
                )
            })?;
        sctx.write_draft_text(&text)?;
    }

    if SETTINGS.resume_postponed {
        let resumed = modules::send::postpone::resume_first(&gateway, &sctx.options).await?;
        sctx.adopt_draft(resumed.msg)?;
        sctx.fcc = resumed.fcc;
    }

    // Command-line attachments.
    if !SETTINGS.attach.is_empty() {
        let mut attachments = modules::attach::AttachCtx::new();
        attachments.rebuild(&sctx.msg);
        for path in &SETTINGS.attach {
            attachments.attach_file(&mut sctx.msg, path)?;
        }
    }

    let (registry, mut reap_events) = BackgroundRegistry::new();

    let mut prompter: Box<dyn Prompter> = if SETTINGS.batch {
        Box::new(BatchPrompter)
    } else {
        Box::new(StdPrompter)
    };
    let mut op_source: Box<dyn OpSource> = if SETTINGS.batch {
        Box::new(ScriptedOps::new([]))
    } else {
        Box::new(StdOpSource)
    };

    let mut outcome = send_message(
        sctx,
        &gateway,
        prompter.as_mut(),
        op_source.as_mut(),
        Some(&registry),
        autocrypt_ref,
        &environment,
    )
    .await?;

    // The single-session index loop: wait for backgrounded editors to
    // be reaped and re-enter compose until the session ends for real.
    while outcome == SendOutcome::Backgrounded {
        let Some(pid) = reap_events.recv().await else {
            break;
        };
        let Some(sctx) = registry.reap(pid) else {
            continue;
        };
        info!("Background editor {} finished; resuming compose", pid);
        outcome = resume_backgrounded(
            sctx,
            &mut options,
            &gateway,
            prompter.as_mut(),
            op_source.as_mut(),
            Some(&registry),
            autocrypt_ref,
            &environment,
        )
        .await?;
    }
    Ok(outcome)
}
