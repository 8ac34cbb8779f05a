//! Entity-to-command serialization.
//!
//! Both the undo machinery and the append-only rewrite need to turn a
//! live entity back into the argv that recreates it. The expiry is
//! serialized separately as an absolute `PEXPIREAT` so replay does not
//! depend on when it happens.

use std::time::{SystemTime, UNIX_EPOCH};

use carmine_resp::CmdLine;

use crate::args::format_score;
use crate::entity::Entity;

/// Builds the argv that recreates `entity` under `key`.
#[must_use]
pub fn entity_to_cmd(key: &str, entity: &Entity) -> CmdLine {
    let mut line: CmdLine = Vec::new();
    match entity {
        Entity::Str(value) => {
            line.push(b"SET".to_vec());
            line.push(key.as_bytes().to_vec());
            line.push(value.to_bytes());
        }
        Entity::List(list) => {
            line.push(b"RPUSH".to_vec());
            line.push(key.as_bytes().to_vec());
            list.for_each_in_range(0, list.len(), |value| {
                line.push(value.to_vec());
                true
            });
        }
        Entity::Hash(hash) => {
            line.push(b"HSET".to_vec());
            line.push(key.as_bytes().to_vec());
            for (field, value) in hash {
                line.push(field.clone());
                line.push(value.clone());
            }
        }
        Entity::Set(set) => {
            line.push(b"SADD".to_vec());
            line.push(key.as_bytes().to_vec());
            line.extend(set.members());
        }
        Entity::SortedSet(zset) => {
            line.push(b"ZADD".to_vec());
            line.push(key.as_bytes().to_vec());
            for element in zset.range_by_rank(0, zset.len(), false) {
                line.push(format_score(element.score).into_bytes());
                line.push(element.member);
            }
        }
    }
    line
}

/// Builds the `PEXPIREAT` argv recording `deadline` for `key`.
#[must_use]
pub fn expiry_to_cmd(key: &str, deadline: SystemTime) -> CmdLine {
    let millis = deadline
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    vec![
        b"PEXPIREAT".to_vec(),
        key.as_bytes().to_vec(),
        millis.to_string().into_bytes(),
    ]
}
