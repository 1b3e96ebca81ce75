/// For narrowing casts where the value range is ensured by the application logic: payloads are
///  at most `max_packet_len` (a `u32`) long, because that is the bound for reading them from a
///  socket in the first place.
/// NB: Panics if the range was not ensured, since that is a bug
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
