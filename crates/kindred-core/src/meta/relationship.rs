use crate::key::KindName;

///
/// Cardinality
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
}

///
/// Direction
///
/// Bidirectional relationships name the back-reference field on the related
/// kind; the cascader keeps it pointed at the owning root.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Unidirectional,
    Bidirectional { back_reference: String },
}

///
/// RelationContainer
///
/// In-memory container shape of the relationship field.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelationContainer {
    Single,
    List,
    Set,
    Array,
}

///
/// OrderingPolicy
///
/// How a one-to-many field preserves iteration order across store round
/// trips: an engine-managed `<field>_INDEX` property, or an explicit integer
/// field declared on the element kind.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OrderingPolicy {
    Implicit,
    Explicit { field: String },
}

///
/// CascadePolicy
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CascadePolicy {
    All,
    Persist,
    Remove,
    None,
}

impl CascadePolicy {
    /// Whether inserts of the owner propagate to related objects.
    #[must_use]
    pub const fn cascades_insert(self) -> bool {
        matches!(self, Self::All | Self::Persist)
    }

    /// Whether deletes of the owner (and element removals) propagate to
    /// related objects. When false, removal is a soft detach: the related
    /// entity stays in the store, merely unlinked.
    #[must_use]
    pub const fn cascades_delete(self) -> bool {
        matches!(self, Self::All | Self::Remove)
    }
}

///
/// RelationshipDescriptor
///
/// Static per-field relationship metadata. Process-wide and read-only;
/// shared by reference through the owning entity descriptor.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelationshipDescriptor {
    pub target: KindName,
    pub cardinality: Cardinality,
    pub direction: Direction,
    pub container: RelationContainer,
    pub ordering: OrderingPolicy,
    pub cascade: CascadePolicy,
    /// Owned relationships pull the related object into the owner's entity
    /// group. Referencing an already-persistent object from a different
    /// group through an owned relationship is a cross-group assignment.
    pub owned: bool,
}

impl RelationshipDescriptor {
    #[must_use]
    pub fn one_to_one(target: KindName) -> Self {
        Self {
            target,
            cardinality: Cardinality::OneToOne,
            direction: Direction::Unidirectional,
            container: RelationContainer::Single,
            ordering: OrderingPolicy::Implicit,
            cascade: CascadePolicy::All,
            owned: true,
        }
    }

    #[must_use]
    pub fn one_to_many(target: KindName) -> Self {
        Self {
            target,
            cardinality: Cardinality::OneToMany,
            direction: Direction::Unidirectional,
            container: RelationContainer::List,
            ordering: OrderingPolicy::Implicit,
            cascade: CascadePolicy::All,
            owned: true,
        }
    }

    #[must_use]
    pub fn bidirectional(mut self, back_reference: impl Into<String>) -> Self {
        self.direction = Direction::Bidirectional {
            back_reference: back_reference.into(),
        };
        self
    }

    #[must_use]
    pub const fn cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub const fn container(mut self, container: RelationContainer) -> Self {
        self.container = container;
        self
    }

    #[must_use]
    pub fn ordered_by(mut self, field: impl Into<String>) -> Self {
        self.ordering = OrderingPolicy::Explicit {
            field: field.into(),
        };
        self
    }

    #[must_use]
    pub const fn unowned(mut self) -> Self {
        self.owned = false;
        self
    }

    #[must_use]
    pub fn back_reference(&self) -> Option<&str> {
        match &self.direction {
            Direction::Unidirectional => None,
            Direction::Bidirectional { back_reference } => Some(back_reference),
        }
    }

    /// Property name carrying the ordering index when the policy is
    /// implicit; `None` when an explicit element field holds it.
    #[must_use]
    pub fn implicit_index_property(&self, field_name: &str) -> Option<String> {
        match &self.ordering {
            OrderingPolicy::Implicit => Some(format!("{field_name}_INDEX")),
            OrderingPolicy::Explicit { .. } => None,
        }
    }
}
