#![forbid(unsafe_code)]

/// Client-supplied page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageRequest<K> {
	/// Key of the last item on the previous page; `None` starts at the top.
	pub offset: Option<K>,
	pub limit: Option<usize>,
}

impl<K> PageRequest<K> {
	pub fn first(limit: Option<usize>) -> Self {
		Self { offset: None, limit }
	}
}

/// Default and maximum page size for a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
	pub default: usize,
	pub cap: usize,
}

impl PageLimits {
	pub const fn new(default: usize, cap: usize) -> Self {
		Self { default, cap }
	}

	/// Effective page size, never zero.
	pub fn effective(&self, requested: Option<usize>) -> usize {
		requested.unwrap_or(self.default).min(self.cap).max(1)
	}
}

/// Slice `items` (already sorted) to the page after `offset`.
///
/// An offset that does not resolve to an item is ignored and the first page is returned.
pub fn page_after<T, K, F>(items: Vec<T>, key: F, offset: Option<&K>, limit: usize) -> Vec<T>
where
	K: PartialEq,
	F: Fn(&T) -> K,
{
	let start = offset
		.and_then(|off| items.iter().position(|item| key(item) == *off))
		.map(|idx| idx + 1)
		.unwrap_or(0);

	items.into_iter().skip(start).take(limit).collect()
}
