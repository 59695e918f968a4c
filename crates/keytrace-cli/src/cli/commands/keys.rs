use std::sync::Arc;

use anyhow::Context;
use keytrace_core::{
    DailyKeyManager, FsBlobStore, KeyRecord, KeytraceConfig, XrpcClient, XrpcKeyPublisher,
};
use serde::Serialize;

use crate::cli::args::KeysTodayArgs;
use crate::exit_codes::SUCCESS;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyReport<'a> {
    kid: String,
    src: String,
    fingerprint: String,
    record: &'a KeyRecord,
}

pub async fn today(args: KeysTodayArgs) -> anyhow::Result<i32> {
    let config = KeytraceConfig::from_env();
    let dir = args.store.clone().unwrap_or_else(|| config.key_dir.clone());

    let mut manager = DailyKeyManager::new(&args.signer_did, Arc::new(FsBlobStore::new(&dir)));
    if let Some(service) = args.publish_to.as_deref() {
        let identifier = args
            .identifier
            .clone()
            .unwrap_or_else(|| args.signer_did.clone());
        let password = args
            .app_password
            .clone()
            .context("publishing needs --app-password or KEYTRACE_APP_PASSWORD")?;
        let publisher = XrpcKeyPublisher::new(XrpcClient::new(&config)?, service, identifier, password);
        manager = manager.with_publisher(Arc::new(publisher));
    }

    let key = manager
        .todays_key()
        .await
        .with_context(|| format!("failed to load key from {}", dir.display()))?;

    let report = KeyReport {
        kid: key.kid(),
        src: key.src.to_string(),
        fingerprint: key.fingerprint()?,
        record: &key.record,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("kid:         {}", report.kid);
        println!("src:         {}", report.src);
        println!("fingerprint: {}", report.fingerprint);
        println!(
            "valid:       {} .. {}",
            report.record.valid_from.to_rfc3339(),
            report.record.valid_until.to_rfc3339()
        );
    }
    Ok(SUCCESS)
}
