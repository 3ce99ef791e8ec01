// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use sha1::{Digest, Sha1};
use tpm::{
    AuthContext, AuthSecret, HashAlgorithm, PcrSelection, PcrValue, PlaintextExposure,
    SealError, SealedBlob, SealedSecret, SealingSession, TpmGeneration,
};
use tpm12::{Ordinal, MAX_SEAL_DATA};
use tpm_sim::{SimulatorControl, TpmSimulator};

fn open() -> (SealingSession<TpmSimulator>, SimulatorControl) {
    tracing_subscriber::fmt::try_init().ok();
    let srk_auth = AuthSecret::sha1(&AuthContext::empty());
    let sim = TpmSimulator::tpm12(*srk_auth.as_bytes()).unwrap();
    let control = sim.control();
    control.extend_pcr(0, b"bios");
    control.extend_pcr(2, b"option roms");
    control.extend_pcr(4, b"mbr");
    control.extend_pcr(7, b"platform policy");
    let session = SealingSession::new(sim).unwrap();
    (session, control)
}

fn count(control: &SimulatorControl, ordinal: Ordinal) -> usize {
    control.command_count(ordinal.to_u32())
}

fn predict(current: &[u8], data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(current);
    hasher.update(Sha1::digest(data));
    hasher.finalize().to_vec()
}

#[test]
fn test_detects_tpm12() {
    let (session, control) = open();
    assert_eq!(session.generation(), TpmGeneration::Tpm12);
    assert_eq!(count(&control, Ordinal::GetCapability), 1);
}

#[test]
fn test_seal_unseal_round_trip() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let selection = PcrSelection::sha1(&[0, 2, 4]);

    let sealed = session.seal(&selection, b"disk-key-0001", &auth).unwrap();
    assert_eq!(sealed.pcr_selection, selection);
    assert!(matches!(sealed.blob, SealedBlob::Tpm12 { .. }));

    let secret = session.unseal(&sealed, &auth).unwrap();
    assert_eq!(&secret[..], b"disk-key-0001");
    assert_eq!(count(&control, Ordinal::Seal), 1);
    assert_eq!(count(&control, Ordinal::Unseal), 1);
    assert_eq!(control.loaded_handles(), 0);
}

#[test]
fn test_repeated_seals_differ() {
    let (session, _control) = open();
    let auth = AuthContext::empty();
    let selection = PcrSelection::sha1(&[0]);

    let first = session.seal(&selection, b"same", &auth).unwrap();
    let second = session.seal(&selection, b"same", &auth).unwrap();
    assert_ne!(first.blob, second.blob);
    assert_eq!(&session.unseal(&first, &auth).unwrap()[..], b"same");
    assert_eq!(&session.unseal(&second, &auth).unwrap()[..], b"same");
}

#[test]
fn test_wrong_passphrase() {
    let (session, control) = open();
    let selection = PcrSelection::sha1(&[0, 2]);
    let wrong = AuthContext::new("hunter2");

    let err = session.seal(&selection, b"secret", &wrong).unwrap_err();
    assert!(err.is_authorization(), "{err}");

    let sealed = session
        .seal(&selection, b"secret", &AuthContext::empty())
        .unwrap();
    let err = session.unseal(&sealed, &wrong).unwrap_err();
    assert!(err.is_authorization(), "{err}");
    assert_eq!(control.loaded_handles(), 0);
}

#[test]
fn test_extend_breaks_policy() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let sealed = session
        .seal(&PcrSelection::sha1(&[0, 2, 4]), b"disk-key-0001", &auth)
        .unwrap();

    control.extend_pcr(2, b"new option rom");
    let err = session.unseal(&sealed, &auth).unwrap_err();
    assert!(err.is_policy_mismatch(), "{err}");
    assert_eq!(control.loaded_handles(), 0);
}

#[test]
fn test_reseal_scenario() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let old_selection = PcrSelection::sha1(&[0, 2, 4]);
    let new_selection = PcrSelection::sha1(&[0, 2, 7]);

    let sealed = session.seal(&old_selection, b"disk-key-0001", &auth).unwrap();
    assert_eq!(&session.unseal(&sealed, &auth).unwrap()[..], b"disk-key-0001");

    let resealed = session
        .reseal(&sealed, &old_selection, &new_selection, &auth)
        .unwrap();
    assert_eq!(resealed.exposure, PlaintextExposure::HostMemory);
    assert_eq!(resealed.sealed.pcr_selection, new_selection);
    assert_eq!(&session.unseal(&sealed, &auth).unwrap()[..], b"disk-key-0001");

    control.extend_pcr(4, b"new mbr");
    assert!(session.unseal(&sealed, &auth).unwrap_err().is_policy_mismatch());
    assert_eq!(
        &session.unseal(&resealed.sealed, &auth).unwrap()[..],
        b"disk-key-0001"
    );

    control.extend_pcr(7, b"new platform policy");
    let err = session.unseal(&resealed.sealed, &auth).unwrap_err();
    assert!(err.is_policy_mismatch(), "{err}");
    assert_eq!(control.loaded_handles(), 0);
}

#[test]
fn test_reseal_to_predicted_values() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let old_selection = PcrSelection::sha1(&[0, 4]);
    let sealed = session.seal(&old_selection, b"upgrade-key", &auth).unwrap();

    let expected = [
        PcrValue::new(0, HashAlgorithm::Sha1, control.pcr_sha1(0).to_vec()),
        PcrValue::new(
            4,
            HashAlgorithm::Sha1,
            predict(&control.pcr_sha1(4), b"upgraded mbr"),
        ),
    ];
    let resealed = session
        .reseal_to_values(&sealed, &old_selection, &expected, &auth)
        .unwrap();
    assert_eq!(resealed.exposure, PlaintextExposure::HostMemory);
    assert_eq!(resealed.sealed.pcr_selection, old_selection);
    assert!(session
        .unseal(&resealed.sealed, &auth)
        .unwrap_err()
        .is_policy_mismatch());

    control.extend_pcr(4, b"upgraded mbr");
    assert_eq!(
        &session.unseal(&resealed.sealed, &auth).unwrap()[..],
        b"upgrade-key"
    );
}

#[test]
fn test_seal_to_current_values() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let expected = [
        PcrValue::new(7, HashAlgorithm::Sha1, control.pcr_sha1(7).to_vec()),
        PcrValue::new(2, HashAlgorithm::Sha1, control.pcr_sha1(2).to_vec()),
    ];
    let sealed = session.seal_to_values(&expected, b"explicit", &auth).unwrap();
    assert_eq!(sealed.pcr_selection, PcrSelection::sha1(&[2, 7]));
    assert_eq!(&session.unseal(&sealed, &auth).unwrap()[..], b"explicit");
}

#[test]
fn test_invalid_selection_sends_nothing() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let sent = control.command_log().len();

    for selection in [
        PcrSelection::sha1(&[]),
        PcrSelection::sha256(&[0]),
        PcrSelection::sha1(&[31]),
    ] {
        let err = session.seal(&selection, b"x", &auth).unwrap_err();
        assert!(
            matches!(err, SealError::PolicyConstruction(_)),
            "{selection}: {err}"
        );
    }
    assert_eq!(control.command_log().len(), sent);
}

#[test]
fn test_oversized_plaintext_sends_nothing() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let selection = PcrSelection::sha1(&[0, 7]);

    let sealed = session.seal(&selection, &[9; MAX_SEAL_DATA], &auth).unwrap();
    assert_eq!(session.unseal(&sealed, &auth).unwrap().len(), MAX_SEAL_DATA);

    let sent = control.command_log().len();
    for len in [MAX_SEAL_DATA + 1, 1 << 16] {
        let err = session.seal(&selection, &vec![9; len], &auth).unwrap_err();
        assert!(
            matches!(err, SealError::PlaintextTooLarge { len: l, max: MAX_SEAL_DATA } if l == len),
            "{err}"
        );
    }
    assert_eq!(control.command_log().len(), sent);
    assert_eq!(control.loaded_handles(), 0);
}

#[test]
fn test_io_failure_is_transport() {
    let (session, control) = open();
    let auth = AuthContext::empty();
    let selection = PcrSelection::sha1(&[0]);

    control.fail_next_command();
    assert!(session.seal(&selection, b"x", &auth).unwrap_err().is_transport());
    let sealed = session.seal(&selection, b"x", &auth).unwrap();
    assert_eq!(&session.unseal(&sealed, &auth).unwrap()[..], b"x");
}

#[test]
fn test_tampered_blob_is_rejected() {
    let (session, _control) = open();
    let auth = AuthContext::empty();
    let sealed = session
        .seal(&PcrSelection::sha1(&[0]), b"integrity", &auth)
        .unwrap();

    let mut tampered = sealed.clone();
    if let SealedBlob::Tpm12 { stored_data } = &mut tampered.blob {
        let last = stored_data.len() - 1;
        stored_data[last] ^= 1;
    }
    assert!(session.unseal(&tampered, &auth).unwrap_err().is_transport());
    assert_eq!(&session.unseal(&sealed, &auth).unwrap()[..], b"integrity");
}

#[test]
fn test_sealed_secret_survives_storage() {
    let (session, _control) = open();
    let auth = AuthContext::empty();
    let sealed = session
        .seal(&PcrSelection::sha1(&[0, 7]), b"stored", &auth)
        .unwrap();

    let json = serde_json::to_value(&sealed).unwrap();
    assert_eq!(json["blob"]["generation"], "tpm12");
    let from_json: SealedSecret = serde_json::from_value(json).unwrap();
    let from_bytes = SealedSecret::from_bytes(&sealed.to_bytes()).unwrap();
    assert_eq!(from_json, sealed);
    assert_eq!(from_bytes, sealed);
    assert_eq!(&session.unseal(&from_bytes, &auth).unwrap()[..], b"stored");
}
