
pub use secp256k1_musig as secpm;
pub use secp256k1_musig::musig::{
	MusigAggNonce, MusigKeyAggCache, MusigPubNonce, MusigPartialSignature, MusigSecNonce,
	MusigSession, MusigSecRand,
};

use bitcoin::{TapNodeHash, TapSighash, TapTweakHash};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{rand, schnorr, Keypair, PublicKey, XOnlyPublicKey};

lazy_static! {
	/// Global secp context for the musig fork of secp256k1.
	pub static ref SECP: secpm::Secp256k1<secpm::All> = secpm::Secp256k1::new();
}

/// Errors from the two-party signing helpers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MusigError {
	#[error("taproot tweak is not a valid scalar")]
	InvalidTweak,
	#[error("secret nonce was already used")]
	NonceReused,
}

// Conversions between the two secp256k1 versions. Both use the same
// serialization so these can't fail on valid input.

pub fn xonly_from(pk: secpm::XOnlyPublicKey) -> XOnlyPublicKey {
	XOnlyPublicKey::from_slice(&pk.serialize()).expect("same serialization")
}

pub fn pubkey_to(pk: PublicKey) -> secpm::PublicKey {
	secpm::PublicKey::from_slice(&pk.serialize()).expect("same serialization")
}

pub fn pubkey_from(pk: secpm::PublicKey) -> PublicKey {
	PublicKey::from_slice(&pk.serialize()).expect("same serialization")
}

pub fn keypair_to(kp: &Keypair) -> secpm::Keypair {
	secpm::Keypair::from_seckey_slice(&SECP, &kp.secret_bytes()).expect("same serialization")
}

pub fn sig_from(s: secpm::schnorr::Signature) -> schnorr::Signature {
	schnorr::Signature::from_slice(&s.to_byte_array()).expect("same serialization")
}

/// Returns the key agg cache for the untweaked internal key.
///
/// Key order is not important as keys are sorted before aggregation.
pub fn key_agg(keys: impl IntoIterator<Item = PublicKey>) -> MusigKeyAggCache {
	let mut keys = keys.into_iter().map(pubkey_to).collect::<Vec<_>>();
	keys.sort_by_key(|k| k.serialize());
	let keys = keys.iter().collect::<Vec<_>>();
	MusigKeyAggCache::new(&SECP, &keys)
}

/// Aggregated keys of a swap output, tweaked to commit to its script tree.
pub struct TaprootKeyAgg {
	pub cache: MusigKeyAggCache,
	pub internal_key: XOnlyPublicKey,
	pub tweak: TapTweakHash,
	pub output_key: XOnlyPublicKey,
}

/// Aggregate the keys and apply the BIP341 tweak for the given merkle root.
pub fn taproot_key_agg(
	keys: impl IntoIterator<Item = PublicKey>,
	merkle_root: TapNodeHash,
) -> Result<TaprootKeyAgg, MusigError> {
	let mut cache = key_agg(keys);
	let internal_key = xonly_from(cache.agg_pk());
	let tweak = TapTweakHash::from_key_and_tweak(internal_key, Some(merkle_root));
	let scalar = secpm::Scalar::from_be_bytes(tweak.to_byte_array())
		.map_err(|_| MusigError::InvalidTweak)?;
	let output = cache.pubkey_xonly_tweak_add(&SECP, &scalar)
		.map_err(|_| MusigError::InvalidTweak)?;
	Ok(TaprootKeyAgg {
		cache: cache,
		internal_key: internal_key,
		tweak: tweak,
		output_key: pubkey_from(output).x_only_public_key().0,
	})
}

/// Generate a nonce pair bound to the aggregated key and the message.
pub fn nonce_pair(
	key: &Keypair,
	agg: &MusigKeyAggCache,
	sighash: TapSighash,
) -> (MusigSecNonce, MusigPubNonce) {
	let kp = keypair_to(key);
	secpm::musig::new_musig_nonce_pair(
		&SECP,
		MusigSecRand::assume_unique_per_nonce_gen(rand::random()),
		Some(agg),
		Some(kp.secret_key()),
		kp.public_key(),
		Some(secpm::Message::from_digest(sighash.to_byte_array())),
		Some(rand::random()),
	).expect("non-zero session id")
}

pub fn nonce_agg(pub_nonces: &[&MusigPubNonce]) -> MusigAggNonce {
	MusigAggNonce::new(&SECP, pub_nonces)
}

fn session(agg: &MusigKeyAggCache, agg_nonce: MusigAggNonce, sighash: TapSighash) -> MusigSession {
	let msg = secpm::Message::from_digest(sighash.to_byte_array());
	MusigSession::new(&SECP, agg, agg_nonce, msg)
}

/// Verify the counterparty's partial signature over `sighash`.
pub fn verify_partial_sig(
	agg: &MusigKeyAggCache,
	sighash: TapSighash,
	signer: (PublicKey, MusigPubNonce),
	other_nonce: MusigPubNonce,
	partial_signature: MusigPartialSignature,
) -> bool {
	let agg_nonce = nonce_agg(&[&signer.1, &other_nonce]);
	session(agg, agg_nonce, sighash).partial_verify(
		&SECP, agg, partial_signature, signer.1, pubkey_to(signer.0),
	)
}

/// Create our partial signature and aggregate it with the counterparty's.
///
/// The secret nonce is consumed.
pub fn sign_and_aggregate(
	agg: &MusigKeyAggCache,
	key: &Keypair,
	sec_nonce: MusigSecNonce,
	our_nonce: MusigPubNonce,
	their_nonce: MusigPubNonce,
	their_sig: MusigPartialSignature,
	sighash: TapSighash,
) -> Result<schnorr::Signature, MusigError> {
	let session = session(agg, nonce_agg(&[&our_nonce, &their_nonce]), sighash);
	let my_sig = session.partial_sign(&SECP, sec_nonce, &keypair_to(key), agg)
		.map_err(|_| MusigError::NonceReused)?;
	Ok(sig_from(session.partial_sig_agg(&[&my_sig, &their_sig])))
}

/// Perform a deterministic partial sign for a counterparty transaction.
///
/// This is only possible when we are the last party to provide a nonce:
/// their nonce is already known.
pub fn deterministic_partial_sign(
	my_key: &Keypair,
	agg: &MusigKeyAggCache,
	their_nonce: &MusigPubNonce,
	sighash: TapSighash,
) -> Result<(MusigPubNonce, MusigPartialSignature), MusigError> {
	let (sec_nonce, pub_nonce) = nonce_pair(my_key, agg, sighash);
	let session = session(agg, nonce_agg(&[their_nonce, &pub_nonce]), sighash);
	let sig = session.partial_sign(&SECP, sec_nonce, &keypair_to(my_key), agg)
		.map_err(|_| MusigError::NonceReused)?;
	Ok((pub_nonce, sig))
}

pub mod serde {
	//! Hex serialization of nonces and partial signatures for JSON APIs.

	use super::*;
	use bitcoin::hex::{DisplayHex, FromHex};
	use ::serde::{Deserialize, Deserializer, Serializer};
	use ::serde::de::Error;

	fn hex_bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
		let s = <std::borrow::Cow<'de, str>>::deserialize(d)?;
		Vec::<u8>::from_hex(&s).map_err(D::Error::custom)
	}

	pub mod pubnonce {
		use super::*;
		pub fn serialize<S: Serializer>(pub_nonce: &MusigPubNonce, s: S) -> Result<S::Ok, S::Error> {
			s.collect_str(&pub_nonce.serialize().as_hex())
		}
		pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<MusigPubNonce, D::Error> {
			MusigPubNonce::from_slice(&hex_bytes(d)?).map_err(D::Error::custom)
		}
	}

	pub mod partialsig {
		use super::*;
		pub fn serialize<S: Serializer>(sig: &MusigPartialSignature, s: S) -> Result<S::Ok, S::Error> {
			s.collect_str(&sig.serialize().as_hex())
		}
		pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<MusigPartialSignature, D::Error> {
			MusigPartialSignature::from_slice(&hex_bytes(d)?).map_err(D::Error::custom)
		}
	}
}
