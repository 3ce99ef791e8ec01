// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tpm::{
    probe, AuthContext, AuthSecret, PcrSelection, SealError, SealingConfig, SealingSession,
    TpmGeneration,
};
use tpm_sim::TpmSimulator;

fn tpm20() -> TpmSimulator {
    tracing_subscriber::fmt::try_init().ok();
    TpmSimulator::tpm20(AuthSecret::sha256(&AuthContext::empty()).as_bytes()).unwrap()
}

fn tpm12() -> TpmSimulator {
    tracing_subscriber::fmt::try_init().ok();
    TpmSimulator::tpm12(*AuthSecret::sha1(&AuthContext::empty()).as_bytes()).unwrap()
}

#[test]
fn test_probe_both_generations() {
    assert_eq!(probe(&mut tpm20()).unwrap(), TpmGeneration::Tpm20);
    assert_eq!(probe(&mut tpm12()).unwrap(), TpmGeneration::Tpm12);
}

#[test]
fn test_unknown_device_is_unsupported() {
    let Err(err) = SealingSession::new(TpmSimulator::unknown().unwrap()) else {
        panic!("session opened on an unknown device");
    };
    assert!(matches!(err, SealError::UnsupportedVersion(_)), "{err}");
}

#[test]
fn test_probe_io_failure_is_transport() {
    let sim = tpm20();
    sim.control().fail_next_command();
    let Err(err) = SealingSession::new(sim) else {
        panic!("probe ignored the channel failure");
    };
    assert!(err.is_transport(), "{err}");
}

#[test]
fn test_pinned_generation_skips_probe() {
    let sim = tpm12();
    let control = sim.control();
    let session =
        SealingSession::with_config(sim, SealingConfig::pinned(TpmGeneration::Tpm12)).unwrap();
    assert_eq!(session.generation(), TpmGeneration::Tpm12);
    assert!(control.command_log().is_empty());
}

#[test]
fn test_blob_from_other_generation() {
    let auth = AuthContext::empty();
    let old = SealingSession::new(tpm12()).unwrap();
    let sealed = old.seal(&PcrSelection::sha1(&[0]), b"legacy", &auth).unwrap();

    let sim = tpm20();
    let control = sim.control();
    let session = SealingSession::new(sim).unwrap();
    let sent = control.command_log().len();

    let err = session.unseal(&sealed, &auth).unwrap_err();
    assert!(matches!(err, SealError::UnsupportedVersion(_)), "{err}");
    let err = session
        .reseal(
            &sealed,
            &PcrSelection::sha1(&[0]),
            &PcrSelection::sha256(&[0]),
            &auth,
        )
        .unwrap_err();
    assert!(matches!(err, SealError::UnsupportedVersion(_)), "{err}");
    assert_eq!(control.command_log().len(), sent);
}

#[test]
fn test_into_channel_returns_device() {
    let session = SealingSession::new(tpm20()).unwrap();
    let mut channel = session.into_channel();
    assert_eq!(probe(&mut channel).unwrap(), TpmGeneration::Tpm20);
}

#[test]
fn test_session_shared_across_threads() {
    let session = SealingSession::new(tpm20()).unwrap();
    let auth = AuthContext::empty();
    let selection = PcrSelection::sha256(&[0, 2]);

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let session = &session;
                let auth = &auth;
                let selection = &selection;
                scope.spawn(move || {
                    let plaintext = [i; 16];
                    let sealed = session.seal(selection, &plaintext, auth).unwrap();
                    let secret = session.unseal(&sealed, auth).unwrap();
                    assert_eq!(&secret[..], &plaintext[..]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
}
