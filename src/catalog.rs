//! マーカーID → コンテンツ（名前・種別・見た目）の静的テーブル

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::marker::MarkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Fruit,
    Vegetable,
    Mascot,
}

/// プリミティブ形状
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Sphere,
    Cone,
    Cube,
    /// 球の体 + 円錐の帽子
    Mascot,
}

/// config.toml の `[[catalog]]` 1件
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogEntry {
    pub id: MarkerId,
    pub name: String,
    pub kind: ItemKind,
    pub shape: Shape,
    /// RGB
    pub color: [u8; 3],
    #[serde(default)]
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub name: String,
    pub kind: ItemKind,
    pub shape: Shape,
    pub color: [u8; 3],
    pub synonyms: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    items: BTreeMap<MarkerId, CatalogItem>,
}

#[rustfmt::skip]
const BUILTIN: &[(MarkerId, &str, ItemKind, Shape, [u8; 3])] = &[
    (0,  "tina",           ItemKind::Mascot,    Shape::Mascot, [250, 200, 80]),
    (1,  "pera",           ItemKind::Fruit,     Shape::Sphere, [190, 210, 70]),
    (2,  "limón",          ItemKind::Fruit,     Shape::Sphere, [250, 230, 60]),
    (3,  "uvas",           ItemKind::Fruit,     Shape::Sphere, [120, 50, 140]),
    (4,  "manzana",        ItemKind::Fruit,     Shape::Sphere, [210, 30, 40]),
    (5,  "naranja",        ItemKind::Fruit,     Shape::Sphere, [250, 140, 20]),
    (6,  "plátano",        ItemKind::Fruit,     Shape::Cone,   [245, 220, 70]),
    (7,  "fresa",          ItemKind::Fruit,     Shape::Cone,   [220, 20, 60]),
    (8,  "sandía",         ItemKind::Fruit,     Shape::Sphere, [40, 150, 50]),
    (9,  "melón",          ItemKind::Fruit,     Shape::Sphere, [210, 220, 120]),
    (10, "cebolla",        ItemKind::Vegetable, Shape::Sphere, [200, 160, 110]),
    (11, "cebolleta",      ItemKind::Vegetable, Shape::Cone,   [150, 200, 90]),
    (12, "lechuga",        ItemKind::Vegetable, Shape::Sphere, [110, 190, 70]),
    (13, "pimiento rojo",  ItemKind::Vegetable, Shape::Cube,   [200, 30, 30]),
    (14, "pimiento verde", ItemKind::Vegetable, Shape::Cube,   [50, 140, 40]),
    (15, "zanahoria",      ItemKind::Vegetable, Shape::Cone,   [240, 120, 20]),
];

impl Default for Catalog {
    fn default() -> Self {
        let items = BUILTIN
            .iter()
            .map(|(id, name, kind, shape, color)| {
                (
                    *id,
                    CatalogItem {
                        name: name.to_string(),
                        kind: *kind,
                        shape: *shape,
                        color: *color,
                        synonyms: Vec::new(),
                    },
                )
            })
            .collect();
        Self { items }
    }
}

impl Catalog {
    /// 設定の上書きがあればそれを使う
    pub fn from_entries(entries: &[CatalogEntry]) -> Self {
        if entries.is_empty() {
            return Self::default();
        }
        let items = entries
            .iter()
            .map(|e| {
                (
                    e.id,
                    CatalogItem {
                        name: e.name.clone(),
                        kind: e.kind,
                        shape: e.shape,
                        color: e.color,
                        synonyms: e.synonyms.clone(),
                    },
                )
            })
            .collect();
        Self { items }
    }

    pub fn get(&self, id: MarkerId) -> Option<&CatalogItem> {
        self.items.get(&id)
    }

    pub fn name(&self, id: MarkerId) -> Option<&str> {
        self.items.get(&id).map(|i| i.name.as_str())
    }

    /// 果物・野菜（マスコット以外）か
    pub fn is_food(&self, id: MarkerId) -> bool {
        matches!(self.kind(id), Some(ItemKind::Fruit | ItemKind::Vegetable))
    }

    pub fn kind(&self, id: MarkerId) -> Option<ItemKind> {
        self.items.get(&id).map(|i| i.kind)
    }

    /// 設定で追加された同義語（組み込みの同義語は matcher 側）
    pub fn synonyms_for(&self, name: &str) -> &[String] {
        let key = crate::games::matcher::normalize(name);
        self.items
            .values()
            .find(|i| crate::games::matcher::normalize(&i.name) == key)
            .map(|i| i.synonyms.as_slice())
            .unwrap_or(&[])
    }

    pub fn ids(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.items.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let c = Catalog::default();
        assert_eq!(c.kind(0), Some(ItemKind::Mascot));
        assert!(!c.is_food(0));
        assert!(c.is_food(1));
        assert_eq!(c.kind(13), Some(ItemKind::Vegetable));
        assert_eq!(c.name(99), None);
    }

    #[test]
    fn test_extra_synonyms_lookup_ignores_accents() {
        let c = Catalog::from_entries(&[CatalogEntry {
            id: 2,
            name: "limón".to_string(),
            kind: ItemKind::Fruit,
            shape: Shape::Sphere,
            color: [250, 230, 60],
            synonyms: vec!["lima".to_string()],
        }]);
        assert_eq!(c.synonyms_for("LIMON"), &["lima".to_string()]);
        assert!(c.synonyms_for("desconocido").is_empty());
    }

    #[test]
    fn test_override_from_config() {
        let entries: Vec<CatalogEntry> = toml::from_str::<toml::Table>(
            r#"
            [[catalog]]
            id = 20
            name = "kiwi"
            kind = "fruit"
            shape = "sphere"
            color = [120, 160, 60]
            "#,
        )
        .unwrap()["catalog"]
            .clone()
            .try_into()
            .unwrap();
        let c = Catalog::from_entries(&entries);
        assert_eq!(c.name(20), Some("kiwi"));
        assert_eq!(c.name(1), None, "override replaces the builtin table");
    }
}
