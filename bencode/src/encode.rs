use itoa::Buffer;

pub fn encode_int(buf: &mut Vec<u8>, value: i64) {
    buf.push(b'i');
    let mut fmt = Buffer::new();
    buf.extend(fmt.format(value).as_bytes());
    buf.push(b'e');
}

pub fn encode_bytes<B: AsRef<[u8]>>(buf: &mut Vec<u8>, value: B) {
    let value = value.as_ref();
    let mut fmt = Buffer::new();
    buf.extend(fmt.format(value.len()).as_bytes());
    buf.push(b':');
    buf.extend(value);
}

/// A type that can be bencoded into a byte buffer.
pub trait Encode {
    fn encode(&self, buf: &mut Vec<u8>);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Streaming dictionary builder. The closing `e` is written on drop.
///
/// Keys must be inserted in sorted order and must be unique; both are
/// asserted in debug builds.
pub struct DictEncoder<'a> {
    buf: &'a mut Vec<u8>,

    #[cfg(debug_assertions)]
    last_key: Vec<u8>,
}

impl<'a> DictEncoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.push(b'd');
        Self {
            buf,
            #[cfg(debug_assertions)]
            last_key: Vec::new(),
        }
    }

    pub fn insert<E: Encode>(&mut self, key: &str, value: E) {
        self.insert_key(key);
        value.encode(self.buf);
    }

    pub fn insert_dict(&mut self, key: &str) -> DictEncoder<'_> {
        self.insert_key(key);
        DictEncoder::new(self.buf)
    }

    pub fn insert_list(&mut self, key: &str) -> ListEncoder<'_> {
        self.insert_key(key);
        ListEncoder::new(self.buf)
    }

    pub fn finish(self) {}

    fn insert_key(&mut self, key: &str) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(
                self.last_key.as_slice() < key.as_bytes(),
                "dict keys must be unique and sorted"
            );
            self.last_key.clear();
            self.last_key.extend(key.as_bytes());
        }
        encode_bytes(self.buf, key);
    }
}

impl Drop for DictEncoder<'_> {
    fn drop(&mut self) {
        self.buf.push(b'e');
    }
}

/// Streaming list builder. The closing `e` is written on drop.
pub struct ListEncoder<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> ListEncoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.push(b'l');
        Self { buf }
    }

    pub fn push<E: Encode>(&mut self, value: E) {
        value.encode(self.buf);
    }

    pub fn push_dict(&mut self) -> DictEncoder<'_> {
        DictEncoder::new(self.buf)
    }

    pub fn finish(self) {}
}

impl Drop for ListEncoder<'_> {
    fn drop(&mut self) {
        self.buf.push(b'e');
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buf: &mut Vec<u8>) {
        (**self).encode(buf);
    }
}

impl Encode for [u8] {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(buf, self);
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(buf, self);
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(buf, self);
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(buf, self);
    }
}

impl Encode for i64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_int(buf, *self);
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(buf, &self[..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int() {
        let mut buf = Vec::new();
        encode_int(&mut buf, -42);
        assert_eq!(b"i-42e", &buf[..]);
    }

    #[test]
    fn bytes() {
        let mut buf = Vec::new();
        encode_bytes(&mut buf, "spam");
        assert_eq!(b"4:spam", &buf[..]);
    }

    #[test]
    fn dict() {
        let mut buf = Vec::new();
        let mut d = DictEncoder::new(&mut buf);
        d.insert("a", 1i64);
        d.insert("b", "two");
        d.finish();
        assert_eq!(b"d1:ai1e1:b3:twoe", &buf[..]);
    }

    #[test]
    fn dict_closed_on_drop() {
        let mut buf = Vec::new();
        let mut d = DictEncoder::new(&mut buf);
        d.insert("x", 9i64);
        drop(d);
        assert_eq!(b"d1:xi9ee", &buf[..]);
    }

    #[test]
    fn nested() {
        let mut buf = Vec::new();
        let mut d = DictEncoder::new(&mut buf);
        let mut a = d.insert_dict("a");
        a.insert("id", &b"xyz"[..]);
        a.finish();
        let mut l = d.insert_list("l");
        l.push(1i64);
        l.push(2i64);
        l.finish();
        d.finish();
        assert_eq!(b"d1:ad2:id3:xyze1:lli1ei2eee", &buf[..]);
    }

    #[test]
    #[should_panic(expected = "sorted")]
    #[cfg(debug_assertions)]
    fn unsorted_keys_panic() {
        let mut buf = Vec::new();
        let mut d = DictEncoder::new(&mut buf);
        d.insert("b", 1i64);
        d.insert("a", 2i64);
    }
}
