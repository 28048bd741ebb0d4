//! Row and section deltas between two layouts of one mapping

/// Coordinates of one row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowPosition {
    /// Group name
    pub group: String,
    /// Index of the group among the mapping's visible groups
    pub section: usize,
    /// Row inside the group, in display order
    pub row: usize,
}

/// A row that appeared, disappeared or changed in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    /// Document key
    pub key: String,
    /// Where the row is (or was)
    pub position: RowPosition,
}

/// A row that changed position within its group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMove {
    /// Document key
    pub key: String,
    /// Position before the changes
    pub from: RowPosition,
    /// Position after the changes
    pub to: RowPosition,
}

/// A group that appeared or disappeared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionChange {
    /// Group name
    pub group: String,
    /// Section index (old index for removals, new index for insertions)
    pub section: usize,
}

/// Changes to apply to a list rendered from a mapping.
///
/// `removed`, `updated` and `moved[].from` are in the old coordinate space;
/// `inserted` and `moved[].to` are in the new one. A row is only `moved` when
/// its order relative to the rows that stayed in its group changed; a row
/// displaced by insertions or removals around it is `updated`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewChanges {
    /// Rows that appeared
    pub inserted: Vec<RowChange>,
    /// Rows whose document changed without moving
    pub updated: Vec<RowChange>,
    /// Rows that moved within their group
    pub moved: Vec<RowMove>,
    /// Rows that disappeared
    pub removed: Vec<RowChange>,
    /// Groups that appeared
    pub sections_inserted: Vec<SectionChange>,
    /// Groups that disappeared
    pub sections_removed: Vec<SectionChange>,
    /// The mapping was rebuilt; discard cached rows and reload everything
    pub reloaded: bool,
}

impl ViewChanges {
    pub(crate) fn reloaded() -> Self {
        Self {
            reloaded: true,
            ..Default::default()
        }
    }

    /// Whether there is nothing to apply
    pub fn is_empty(&self) -> bool {
        !self.reloaded
            && self.inserted.is_empty()
            && self.updated.is_empty()
            && self.moved.is_empty()
            && self.removed.is_empty()
            && self.sections_inserted.is_empty()
            && self.sections_removed.is_empty()
    }
}

/// Positions of a set of keys plus the visible groups, at one point in time
#[derive(Debug, Clone, Default)]
pub(crate) struct Layout {
    pub(crate) sections: Vec<String>,
    pub(crate) rows: Vec<(String, Option<RowPosition>)>,
}

/// Diff two layouts taken over the same key list
pub(crate) fn diff(before: &Layout, after: &Layout) -> ViewChanges {
    let mut changes = ViewChanges::default();

    for (section, group) in before.sections.iter().enumerate() {
        if !after.sections.contains(group) {
            changes.sections_removed.push(SectionChange {
                group: group.clone(),
                section,
            });
        }
    }
    for (section, group) in after.sections.iter().enumerate() {
        if !before.sections.contains(group) {
            changes.sections_inserted.push(SectionChange {
                group: group.clone(),
                section,
            });
        }
    }

    // Rows that left or entered each group, so a row that only shifted
    // because of them is reported as updated rather than moved
    let mut departures: Vec<&RowPosition> = Vec::new();
    let mut arrivals: Vec<&RowPosition> = Vec::new();
    for ((_, old), (_, new)) in before.rows.iter().zip(after.rows.iter()) {
        match (old, new) {
            (Some(from), Some(to)) if from.group == to.group => {}
            _ => {
                departures.extend(old.as_ref());
                arrivals.extend(new.as_ref());
            }
        }
    }
    let settled_row = |position: &RowPosition, shifted: &[&RowPosition]| {
        let above = shifted
            .iter()
            .filter(|p| p.group == position.group && p.row < position.row)
            .count();
        position.row - above
    };

    for ((key, old), (_, new)) in before.rows.iter().zip(after.rows.iter()) {
        match (old, new) {
            (None, None) => {}
            (None, Some(to)) => changes.inserted.push(RowChange {
                key: key.clone(),
                position: to.clone(),
            }),
            (Some(from), None) => changes.removed.push(RowChange {
                key: key.clone(),
                position: from.clone(),
            }),
            (Some(from), Some(to)) if from.group != to.group => {
                changes.removed.push(RowChange {
                    key: key.clone(),
                    position: from.clone(),
                });
                changes.inserted.push(RowChange {
                    key: key.clone(),
                    position: to.clone(),
                });
            }
            (Some(from), Some(to))
                if settled_row(from, &departures[..]) != settled_row(to, &arrivals[..]) =>
            {
                changes.moved.push(RowMove {
                    key: key.clone(),
                    from: from.clone(),
                    to: to.clone(),
                })
            }
            (Some(from), Some(_)) => changes.updated.push(RowChange {
                key: key.clone(),
                position: from.clone(),
            }),
        }
    }

    changes
}
