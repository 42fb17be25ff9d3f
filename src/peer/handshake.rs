use peer_proto::handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL};
use peer_proto::mse::{
    self, CipherPair, DhKey, Rc4, CRYPTO_PLAIN, CRYPTO_RC4, KEY_LEN, MAX_PAD_LEN, VC,
};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::EncryptionPolicy;
use crate::error::{Error, Result};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A peer transport after handshaking: plaintext or RC4 on both
/// directions.
pub struct PeerStream<S> {
    stream: S,
    cipher: Option<CipherPair>,
}

impl<S: AsyncStream> PeerStream<S> {
    pub fn plain(stream: S) -> Self {
        Self {
            stream,
            cipher: None,
        }
    }

    pub fn encrypted(stream: S, cipher: CipherPair) -> Self {
        Self {
            stream,
            cipher: Some(cipher),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.stream.read_exact(buf).await?;
        if let Some(c) = &mut self.cipher {
            c.decrypt(buf);
        }
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.cipher {
            Some(c) => {
                let mut out = data.to_vec();
                c.encrypt(&mut out);
                self.stream.write_all(&out).await
            }
            None => self.stream.write_all(data).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush().await
    }

    /// Split into receive and send halves, each with its own keystream
    /// direction.
    pub fn split(self) -> (PeerReader<S>, PeerWriter<S>) {
        let (r, w) = tokio::io::split(self.stream);
        let (enc, dec) = match self.cipher {
            Some(c) => {
                let (enc, dec) = c.into_parts();
                (Some(enc), Some(dec))
            }
            None => (None, None),
        };
        (PeerReader { inner: r, dec }, PeerWriter { inner: w, enc })
    }
}

pub struct PeerReader<S> {
    inner: tokio::io::ReadHalf<S>,
    dec: Option<Rc4>,
}

impl<S: AsyncStream> PeerReader<S> {
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf).await?;
        if let Some(d) = &mut self.dec {
            d.apply(buf);
        }
        Ok(())
    }

    /// Read whatever the socket has, decrypted. Returns 0 at EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if let Some(d) = &mut self.dec {
            d.apply(&mut buf[..n]);
        }
        Ok(n)
    }
}

pub struct PeerWriter<S> {
    inner: tokio::io::WriteHalf<S>,
    enc: Option<Rc4>,
}

impl<S: AsyncStream> PeerWriter<S> {
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match &mut self.enc {
            Some(e) => {
                let mut out = data.to_vec();
                e.apply(&mut out);
                self.inner.write_all(&out).await
            }
            None => self.inner.write_all(data).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

pub struct HandshakeOutcome<S> {
    pub stream: PeerStream<S>,
    pub remote: Handshake,
}

/// Dial-side handshake. `Prefer` and `Require` run the encryption
/// handshake; a `Prefer` failure is reported to the caller, which may
/// redial in plaintext.
pub async fn outgoing<S: AsyncStream>(
    stream: S,
    ours: &Handshake,
    policy: EncryptionPolicy,
) -> Result<HandshakeOutcome<S>> {
    match policy {
        EncryptionPolicy::Disabled | EncryptionPolicy::AllowIncoming => {
            plain_outgoing(stream, ours).await
        }
        EncryptionPolicy::Prefer | EncryptionPolicy::Require => {
            mse_outgoing(stream, ours, policy).await
        }
    }
}

/// Accept-side handshake against a single torrent.
pub async fn incoming<S: AsyncStream>(
    stream: S,
    ours: &Handshake,
    policy: EncryptionPolicy,
) -> Result<HandshakeOutcome<S>> {
    let (outcome, _) = incoming_any(stream, std::slice::from_ref(ours), policy).await?;
    Ok(outcome)
}

/// Accept-side handshake routed across every torrent we serve. The first
/// byte decides: the protocol length prefix means plaintext, anything else
/// starts a DH exchange. Returns the index of the matched candidate.
pub async fn incoming_any<S: AsyncStream>(
    mut stream: S,
    candidates: &[Handshake],
    policy: EncryptionPolicy,
) -> Result<(HandshakeOutcome<S>, usize)> {
    if candidates.is_empty() {
        return Err(Error::input("No torrents to accept for"));
    }

    // Dispatch on the whole protocol string, not the first byte: a DH
    // public key may begin with 0x13.
    let mut head = [0u8; 20];
    stream.read_exact(&mut head).await?;

    if head == *PROTOCOL {
        if policy == EncryptionPolicy::Require {
            return Err(Error::protocol("Plaintext connection refused"));
        }

        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[..20].copy_from_slice(&head);
        stream.read_exact(&mut buf[20..]).await?;

        let idx = candidates
            .iter()
            .position(|c| c.info_hash.as_ref() == &buf[28..48])
            .ok_or_else(|| Error::protocol("Unknown torrent"))?;
        let ours = &candidates[idx];
        let remote = ours.read(&buf)?;

        stream.write_all(&ours.to_bytes()).await?;
        stream.flush().await?;

        return Ok((
            HandshakeOutcome {
                stream: PeerStream::plain(stream),
                remote,
            },
            idx,
        ));
    }

    if policy == EncryptionPolicy::Disabled {
        return Err(Error::protocol("Encrypted connection refused"));
    }

    mse_incoming(stream, head, candidates, policy).await
}

async fn plain_outgoing<S: AsyncStream>(
    mut stream: S,
    ours: &Handshake,
) -> Result<HandshakeOutcome<S>> {
    log::trace!("Write handshake message");
    stream.write_all(&ours.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let remote = ours.read(&buf)?;

    Ok(HandshakeOutcome {
        stream: PeerStream::plain(stream),
        remote,
    })
}

fn random_pad() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=MAX_PAD_LEN.min(96));
    let mut pad = vec![0u8; len];
    rng.fill(&mut pad[..]);
    pad
}

async fn mse_outgoing<S: AsyncStream>(
    mut stream: S,
    ours: &Handshake,
    policy: EncryptionPolicy,
) -> Result<HandshakeOutcome<S>> {
    let info_hash = *ours.info_hash.as_bytes();
    let key = DhKey::generate(&mut rand::thread_rng());

    // Ya + PadA.
    stream.write_all(key.public_bytes()).await?;
    stream.write_all(&random_pad()).await?;
    stream.flush().await?;

    // Yb. Any PadB is absorbed by the VC scan below.
    let mut peer_public = [0u8; KEY_LEN];
    stream.read_exact(&mut peer_public).await?;
    let secret = key.shared_secret(&peer_public);

    let (key_a, key_b) = mse::derive_keys(&secret, &info_hash);
    let mut enc = Rc4::new(&key_a);
    enc.discard(1024);

    // HASH('req1', S), masked torrent id, then the encrypted request:
    // VC, crypto_provide, len(PadC)=0, len(IA), IA = our handshake.
    let provide = match policy {
        EncryptionPolicy::Require => CRYPTO_RC4,
        _ => CRYPTO_RC4 | CRYPTO_PLAIN,
    };

    let ia = ours.to_bytes();
    let mut request = Vec::with_capacity(16 + ia.len());
    request.extend(VC);
    request.extend(provide.to_be_bytes());
    request.extend(0u16.to_be_bytes());
    request.extend((ia.len() as u16).to_be_bytes());
    request.extend(ia);
    enc.apply(&mut request);

    stream.write_all(&mse::req1_hash(&secret)).await?;
    stream
        .write_all(&mse::req2_xor_req3(&info_hash, &secret))
        .await?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    // Find the encrypted VC in at most PadB + 8 bytes.
    let mut vc_pattern = VC;
    let mut preview = Rc4::new(&key_b);
    preview.discard(1024);
    preview.apply(&mut vc_pattern);

    scan_for(&mut stream, &vc_pattern, MAX_PAD_LEN + VC.len()).await?;

    let mut dec = Rc4::new(&key_b);
    dec.discard(1024 + VC.len());

    // crypto_select + len(PadD).
    let mut head = [0u8; 6];
    stream.read_exact(&mut head).await?;
    dec.apply(&mut head);
    let select = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
    let pad_d = u16::from_be_bytes([head[4], head[5]]) as usize;
    if pad_d > MAX_PAD_LEN {
        return Err(Error::protocol("PadD too large"));
    }

    let mut pad = vec![0u8; pad_d];
    stream.read_exact(&mut pad).await?;
    dec.apply(&mut pad);

    let mut stream = match select {
        CRYPTO_RC4 => PeerStream::encrypted(stream, CipherPair::from_streams(enc, dec)),
        CRYPTO_PLAIN if policy != EncryptionPolicy::Require => PeerStream::plain(stream),
        _ => return Err(Error::protocol("Crypto selection failed")),
    };

    // The responder's handshake follows on the agreed transport.
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let remote = ours.read(&buf)?;

    Ok(HandshakeOutcome { stream, remote })
}

async fn mse_incoming<S: AsyncStream>(
    mut stream: S,
    head: [u8; 20],
    candidates: &[Handshake],
    policy: EncryptionPolicy,
) -> Result<(HandshakeOutcome<S>, usize)> {
    // Ya; the first bytes were consumed for dispatch.
    let mut peer_public = [0u8; KEY_LEN];
    peer_public[..20].copy_from_slice(&head);
    stream.read_exact(&mut peer_public[20..]).await?;

    let key = DhKey::generate(&mut rand::thread_rng());
    stream.write_all(key.public_bytes()).await?;
    stream.write_all(&random_pad()).await?;
    stream.flush().await?;

    let secret = key.shared_secret(&peer_public);

    // Sync on HASH('req1', S) past PadA.
    let req1 = mse::req1_hash(&secret);
    scan_for(&mut stream, &req1, MAX_PAD_LEN + req1.len()).await?;

    // The masked torrent id picks the torrent without naming it.
    let mut masked = [0u8; 20];
    stream.read_exact(&mut masked).await?;
    let req3 = mse::sha1_pair(b"req3", &secret);
    let unmasked = mse::xor20(&masked, &req3);

    let idx = candidates
        .iter()
        .position(|c| mse::sha1_pair(b"req2", c.info_hash.as_bytes()) == unmasked)
        .ok_or_else(|| Error::protocol("Unknown torrent in encrypted handshake"))?;
    let ours = &candidates[idx];
    let info_hash = *ours.info_hash.as_bytes();

    let (key_a, key_b) = mse::derive_keys(&secret, &info_hash);
    let mut dec = Rc4::new(&key_a);
    dec.discard(1024);

    // VC, crypto_provide, len(PadC).
    let mut head = [0u8; 14];
    stream.read_exact(&mut head).await?;
    dec.apply(&mut head);
    if head[..8] != VC {
        return Err(Error::protocol("Bad verification constant"));
    }
    let provide = u32::from_be_bytes([head[8], head[9], head[10], head[11]]);
    let pad_c = u16::from_be_bytes([head[12], head[13]]) as usize;
    if pad_c > MAX_PAD_LEN {
        return Err(Error::protocol("PadC too large"));
    }

    let mut pad = vec![0u8; pad_c];
    stream.read_exact(&mut pad).await?;
    dec.apply(&mut pad);

    let mut ia_len = [0u8; 2];
    stream.read_exact(&mut ia_len).await?;
    dec.apply(&mut ia_len);
    let ia_len = u16::from_be_bytes(ia_len) as usize;

    let mut ia = vec![0u8; ia_len];
    stream.read_exact(&mut ia).await?;
    dec.apply(&mut ia);

    let select = if provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if provide & CRYPTO_PLAIN != 0 && policy != EncryptionPolicy::Require {
        CRYPTO_PLAIN
    } else {
        return Err(Error::protocol("No acceptable crypto method"));
    };

    let mut enc = Rc4::new(&key_b);
    enc.discard(1024);

    let mut response = Vec::with_capacity(14);
    response.extend(VC);
    response.extend(select.to_be_bytes());
    response.extend(0u16.to_be_bytes());
    enc.apply(&mut response);
    stream.write_all(&response).await?;
    stream.flush().await?;

    let mut stream = if select == CRYPTO_RC4 {
        PeerStream::encrypted(stream, CipherPair::from_streams(enc, dec))
    } else {
        PeerStream::plain(stream)
    };

    // IA is the initiator's handshake; read it off the wire if it was not
    // included.
    let remote = if ia.len() == HANDSHAKE_LEN {
        ours.read(&ia)?
    } else if ia.is_empty() {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        ours.read(&buf)?
    } else {
        return Err(Error::protocol("Unexpected initial payload length"));
    };

    stream.write_all(&ours.to_bytes()).await?;
    stream.flush().await?;

    Ok((HandshakeOutcome { stream, remote }, idx))
}

/// Read byte-at-a-time until `pattern` appears, consuming at most
/// `max_scan` bytes.
async fn scan_for<S: AsyncStream>(stream: &mut S, pattern: &[u8], max_scan: usize) -> Result<()> {
    let mut window = Vec::with_capacity(pattern.len());
    let mut scanned = 0;

    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        scanned += 1;

        window.push(byte[0]);
        if window.len() > pattern.len() {
            window.remove(0);
        }
        if window == pattern {
            return Ok(());
        }
        if scanned > max_scan {
            return Err(Error::protocol("Resynchronization failed"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_proto::InfoHash;

    fn handshakes() -> (Handshake, Handshake) {
        let info_hash = InfoHash([9; 20]);
        (
            Handshake::new(info_hash, [1; 20]),
            Handshake::new(info_hash, [2; 20]),
        )
    }

    async fn run_pair(
        dial_policy: EncryptionPolicy,
        accept_policy: EncryptionPolicy,
    ) -> Result<(HandshakeOutcome<tokio::io::DuplexStream>, HandshakeOutcome<tokio::io::DuplexStream>)>
    {
        let (a, b) = tokio::io::duplex(4096);
        let (ours, theirs) = handshakes();

        let dial = tokio::spawn(async move { outgoing(a, &ours, dial_policy).await });
        let accept = tokio::spawn(async move { incoming(b, &theirs, accept_policy).await });

        let dialed = dial.await.unwrap()?;
        let accepted = accept.await.unwrap()?;
        Ok((dialed, accepted))
    }

    #[tokio::test]
    async fn plain_handshake() {
        let (dialed, accepted) = run_pair(
            EncryptionPolicy::Disabled,
            EncryptionPolicy::AllowIncoming,
        )
        .await
        .unwrap();

        assert!(!dialed.stream.is_encrypted());
        assert!(!accepted.stream.is_encrypted());
        assert_eq!(dialed.remote.peer_id, [2; 20]);
        assert_eq!(accepted.remote.peer_id, [1; 20]);
    }

    #[tokio::test]
    async fn encrypted_handshake() {
        let (mut dialed, mut accepted) =
            run_pair(EncryptionPolicy::Require, EncryptionPolicy::Require)
                .await
                .unwrap();

        assert!(dialed.stream.is_encrypted());
        assert!(accepted.stream.is_encrypted());
        assert_eq!(dialed.remote.peer_id, [2; 20]);
        assert_eq!(accepted.remote.peer_id, [1; 20]);

        // Post-handshake traffic flows both ways through RC4.
        dialed.stream.write_all(b"ping").await.unwrap();
        dialed.stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        accepted.stream.write_all(b"pong").await.unwrap();
        accepted.stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        dialed.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn prefer_meets_allow_incoming() {
        let (dialed, accepted) = run_pair(
            EncryptionPolicy::Prefer,
            EncryptionPolicy::AllowIncoming,
        )
        .await
        .unwrap();

        assert!(dialed.stream.is_encrypted());
        assert!(accepted.stream.is_encrypted());
    }

    #[tokio::test]
    async fn require_rejects_plaintext_dialer() {
        let (a, b) = tokio::io::duplex(4096);
        let (ours, theirs) = handshakes();

        let dial = tokio::spawn(async move {
            outgoing(a, &ours, EncryptionPolicy::Disabled).await
        });
        let accept = tokio::spawn(async move {
            incoming(b, &theirs, EncryptionPolicy::Require).await
        });

        assert!(accept.await.unwrap().is_err());
        let _ = dial.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_info_hash_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let ours = Handshake::new(InfoHash([9; 20]), [1; 20]);
        let theirs = Handshake::new(InfoHash([8; 20]), [2; 20]);

        let dial = tokio::spawn(async move {
            outgoing(a, &ours, EncryptionPolicy::Disabled).await
        });
        let accept = tokio::spawn(async move {
            incoming(b, &theirs, EncryptionPolicy::AllowIncoming).await
        });

        assert!(accept.await.unwrap().is_err());
        let _ = dial.await;
    }

    #[tokio::test]
    async fn encrypted_wrong_info_hash_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let ours = Handshake::new(InfoHash([9; 20]), [1; 20]);
        let theirs = Handshake::new(InfoHash([8; 20]), [2; 20]);

        let dial = tokio::spawn(async move {
            outgoing(a, &ours, EncryptionPolicy::Require).await
        });
        let accept = tokio::spawn(async move {
            incoming(b, &theirs, EncryptionPolicy::Require).await
        });

        assert!(accept.await.unwrap().is_err());
        let _ = dial.await;
    }
}
