//! Bottom-up directory attributes.

use std::path::PathBuf;

use crate::item::Attributes;

/// Agreement state of one rolled-up attribute during a pass.
#[derive(Clone, Debug, PartialEq)]
enum Candidate<T> {
    Unset,
    Agreed(T),
    /// Children disagreed; stays void for the rest of the pass.
    Void,
}

impl<T: PartialEq> Candidate<T> {
    fn offer(&mut self, value: Option<T>) {
        let Some(value) = value else {
            return;
        };
        match self {
            Candidate::Unset => *self = Candidate::Agreed(value),
            Candidate::Agreed(current) if *current == value => {}
            Candidate::Agreed(_) => *self = Candidate::Void,
            Candidate::Void => {}
        }
    }

    fn into_option(self) -> Option<T> {
        match self {
            Candidate::Agreed(value) => Some(value),
            Candidate::Unset | Candidate::Void => None,
        }
    }
}

/// Derive a directory's attributes from `current` and its children.
///
/// `length` sums over children carrying one. `artist`, `album` and `image`
/// survive only while every child carrying them agrees; children without
/// the attribute are neutral. A surviving image needs an agreeing artist or
/// album to stick. An authored image is never replaced.
pub fn aggregate(current: &Attributes, children: &[Attributes]) -> Attributes {
    let mut length = None::<f64>;
    let mut artist = Candidate::Unset;
    let mut album = Candidate::Unset;
    let mut image = Candidate::<PathBuf>::Unset;

    for child in children {
        if let Some(child_length) = child.length {
            *length.get_or_insert(0.0) += child_length;
        }
        artist.offer(child.artist.clone());
        album.offer(child.album.clone());
        image.offer(child.image.clone());
    }

    let artist = artist.into_option();
    let album = album.into_option();
    let mut out = current.clone();

    out.length = length;
    if !current.image_authored {
        out.image = image
            .into_option()
            .filter(|_| artist.is_some() || album.is_some());
    }
    out.artist = artist;
    out.album = album;
    out
}

/// Whether persisting `next` over `current` would change anything rolled up.
pub fn changed(current: &Attributes, next: &Attributes) -> bool {
    current.length != next.length
        || current.artist != next.artist
        || current.album != next.album
        || current.image != next.image
}
