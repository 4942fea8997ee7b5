/// Identifies a registered source across calls to [`Epoll::wait`](crate::epoll::Epoll::wait).
///
/// The runtime's registry (`crate::registry`) additionally uses the raw `usize` as an index
/// into its entry table, so `Token` values handed to `Epoll::add` should be stable for the
/// lifetime of the registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    #[inline]
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    #[inline]
    fn from(val: Token) -> usize {
        val.0
    }
}
