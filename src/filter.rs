//! Sale-post predicate and the mapping from raw posts to queue items.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::WorkItem;
use crate::reddit::RawPost;

static SALE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[wts\]").expect("valid sale tag regex"));

/// True when the literal `[WTS]` tag appears in the title or the body,
/// ignoring case. `[WTSS]`, `[WTS ]` and a bare `WTS` do not count.
pub fn is_sale_listing(title: &str, body: &str) -> bool {
    SALE_TAG.is_match(title) || SALE_TAG.is_match(body)
}

/// Map an accepted post to a work item, copying fields verbatim.
pub fn to_work_item(post: &RawPost) -> Option<WorkItem> {
    if !is_sale_listing(&post.title, &post.body) {
        return None;
    }
    Some(WorkItem {
        post_id: post.id.clone(),
        url: post.url.clone(),
        title: post.title.clone(),
        body: post.body.clone(),
        seller_username: post.author.clone(),
    })
}
