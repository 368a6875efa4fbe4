//! 音声認識結果と正解名の照合（全ミニゲーム共通の純関数）

use crate::marker::MarkerId;

/// 正解名 → 言い換え
#[rustfmt::skip]
const SYNONYMS: &[(&str, &[&str])] = &[
    ("pera",           &["pera"]),
    ("cebolleta",      &["cebolleta", "cebollino", "cebolla verde"]),
    ("cebolla",        &["cebolla"]),
    ("lechuga",        &["lechuga"]),
    ("limon",          &["limon", "limón"]),
    ("pimiento rojo",  &["pimiento rojo", "pimiento", "pimentón rojo", "chile rojo"]),
    ("pimiento verde", &["pimiento verde", "pimiento", "pimentón verde", "chile verde"]),
    ("uvas",           &["uva", "uvas", "racimo"]),
    ("zanahoria",      &["zanahoria"]),
    ("platano",        &["platano", "plátano", "banana"]),
    ("fresa",          &["fresa", "frutilla"]),
    ("sandia",         &["sandia", "sandía"]),
    ("melon",          &["melon", "melón"]),
];

/// 小文字化・アクセント除去・句読点除去・空白の正規化
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .chars()
        .flat_map(|c| c.to_lowercase())
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            c if c.is_alphanumeric() || c.is_whitespace() => c,
            _ => ' ',
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn builtin_synonyms(expected_norm: &str) -> &'static [&'static str] {
    SYNONYMS
        .iter()
        .find(|(name, _)| *name == expected_norm)
        .map(|(_, syns)| *syns)
        .unwrap_or(&[])
}

/// `heard` が `expected` を言っているか
pub fn matches(heard: &str, expected: &str) -> bool {
    matches_with(heard, expected, &[])
}

/// 追加の同義語つき照合
pub fn matches_with(heard: &str, expected: &str, extra: &[String]) -> bool {
    mention_position(heard, expected, extra).is_some()
}

/// 照合に成功した場合、正規化後の `heard` 中での位置と長さ
pub fn mention_position(heard: &str, expected: &str, extra: &[String]) -> Option<(usize, usize)> {
    let h = normalize(heard);
    let e = normalize(expected);
    if h.is_empty() || e.is_empty() {
        return None;
    }

    // 正解名がそのまま含まれる
    if let Some(pos) = h.find(&e) {
        return Some((pos, e.len()));
    }
    // 聞き取りが正解名の一部（短すぎるものは除く）
    if h.chars().count() >= 3 && e.contains(&h) {
        return Some((0, h.len()));
    }
    // 同義語
    let synonyms = builtin_synonyms(&e)
        .iter()
        .map(|s| normalize(s))
        .chain(extra.iter().map(|s| normalize(s)));
    let mut best: Option<(usize, usize)> = None;
    for syn in synonyms {
        if syn.is_empty() {
            continue;
        }
        if let Some(pos) = h.find(&syn) {
            let better = match best {
                None => true,
                Some((bp, bl)) => pos < bp || (pos == bp && syn.len() > bl),
            };
            if better {
                best = Some((pos, syn.len()));
            }
        }
    }
    if best.is_some() {
        return best;
    }
    // 一語だけの回答は正解名のどれかの語と一致すればよい
    if !h.contains(' ') && h.chars().count() > 2 && e.split(' ').any(|w| w == h) {
        return Some((0, h.len()));
    }
    None
}

/// 発話中で言及された候補を、発話内の出現順に返す。
/// 同じ位置で重なる場合は長い方（"pimiento rojo" > "pimiento"）を採る。
pub fn find_mentions(heard: &str, candidates: &[(MarkerId, &str, &[String])]) -> Vec<MarkerId> {
    let mut hits: Vec<(usize, usize, MarkerId)> = candidates
        .iter()
        .filter_map(|(id, name, extra)| {
            mention_position(heard, name, extra).map(|(pos, len)| (pos, len, *id))
        })
        .collect();
    hits.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut result = Vec::new();
    let mut covered_until = 0usize;
    for (pos, len, id) in hits {
        if !result.is_empty() && pos < covered_until {
            continue;
        }
        if !result.contains(&id) {
            result.push(id);
        }
        covered_until = pos + len;
    }
    result
}
